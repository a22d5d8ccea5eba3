use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use log::*;

use lab_bench::archive::{save_npy, Archive};
use lab_bench::config::{Config, InstrumentsConfig};
use lab_bench::experiment::converter::EfficiencyMap;
use lab_bench::experiment::peltier::{PeltierTrace, PwmTrace};
use lab_bench::experiment::{converter, peltier, power, regulation, solar};
use lab_bench::instrument::{Instrument, Keithley2450, Ngu401, ScpiSocket};
use lab_bench::plot;
use lab_bench::plot::power::PowerRecord;
use lab_bench::temperature::TemperatureReader;
use lab_bench::util::MonotonicClock;

/// Bench automation for the NGU401 and Keithley 2450.
#[derive(Parser)]
#[command(name = "lab_bench", version)]
struct Cli {
    /// More log output (-v info, -vv debug). RUST_LOG takes precedence.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// TOML configuration; built-in defaults when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct Output {
    /// Archive to write instead of the configured one.
    #[arg(short, long)]
    output: Option<PathBuf>,
}

impl Output {
    fn or(self, configured: &Path) -> PathBuf {
        self.output.unwrap_or_else(|| configured.to_path_buf())
    }
}

#[derive(Subcommand)]
enum Command {
    /// DC-DC converter efficiency map (K2450 source, NGU401 load).
    Converter(Output),
    /// ESP32 supply current profile.
    Power(Output),
    /// Peltier element under slow voltage steps.
    PeltierContinuous(Output),
    /// Peltier element under short voltage pulses.
    PeltierPulse(Output),
    /// Peltier element driven by PWM over a range of duty cycles.
    PeltierPwm(Output),
    /// NGU401 voltage regulation under load steps.
    RegulationLoad(Output),
    /// NGU401 current regulation in current priority mode.
    RegulationCpm(Output),
    /// NGU401 response to the analog modulation input.
    Modulation(Output),
    /// Solar panel I-V curve.
    Solar(Output),

    PlotConverter {
        #[arg(short, long)]
        input: Option<PathBuf>,
        #[arg(short, long)]
        title: Option<String>,
    },
    PlotPower {
        /// SMU archive.
        #[arg(long)]
        smu: Option<PathBuf>,
        /// Scope archive with `ch1` and `ch2`; `scope.npz` beside the SMU
        /// archive by default.
        #[arg(long)]
        scope: Option<PathBuf>,
    },
    PlotPeltier {
        #[arg(long)]
        step: Option<PathBuf>,
        #[arg(long)]
        pulse: Option<PathBuf>,
        #[arg(long)]
        pwm: Option<PathBuf>,
        /// Figure directory; the step archive's directory by default.
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },
    /// Renders every `[[plot.regulation]]` job.
    PlotRegulation,
    PlotModulation {
        #[arg(short, long)]
        input: Option<PathBuf>,
        #[arg(short, long)]
        title: Option<String>,
    },
    PlotChamber {
        /// Controller log.
        input: PathBuf,
    },
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn connect(addr: &str, cfg: &InstrumentsConfig) -> Result<ScpiSocket> {
    let timeout = cfg.timeout()?;
    let mut socket = ScpiSocket::connect(addr, timeout).with_context(|| format!("connecting to {}", addr))?;
    info!("{}", socket.query("*IDN?")?.trim());
    Ok(socket)
}

fn ngu401(cfg: &Config) -> Result<Ngu401<ScpiSocket>> {
    Ok(Ngu401::new(connect(&cfg.instruments.ngu401, &cfg.instruments)?))
}

fn temperature_sensor(cfg: &Config) -> Result<TemperatureReader<Box<dyn serialport::SerialPort>>> {
    TemperatureReader::open(&cfg.temperature.port, cfg.temperature.baud_rate)
        .with_context(|| format!("opening temperature sensor on {}", cfg.temperature.port))
}

fn save(archive: &Archive, path: &Path) -> Result<()> {
    archive
        .save(path)
        .with_context(|| format!("saving {}", path.display()))
}

fn load(path: &Path) -> Result<Archive> {
    Archive::load(path).with_context(|| format!("loading {}", path.display()))
}

fn stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn run(command: Command, cfg: &Config) -> Result<()> {
    let mut clock = MonotonicClock::start();
    let size = (cfg.plot.width, cfg.plot.height);

    match command {
        Command::Converter(out) => {
            let path = out.or(&cfg.converter.output);
            let mut source = Keithley2450::new(connect(&cfg.instruments.k2450, &cfg.instruments)?);
            let mut load = ngu401(cfg)?;
            let map = converter::sweep(&mut source, &mut load, &mut clock, &cfg.converter)?;
            info!("{} of {} points measured", map.measured(), map.v_table.len() * map.i_table.len());
            save(&map.into_archive()?, &path)?;
        }
        Command::Power(out) => {
            let path = out.or(&cfg.power.output);
            let archive = power::run(&mut ngu401(cfg)?, &mut clock, &cfg.power, &cfg.fastlog)?;
            save(&archive, &path)?;
        }
        Command::PeltierContinuous(out) => {
            let path = out.or(&cfg.peltier_continuous.output);
            let mut sensor = temperature_sensor(cfg)?;
            let trace = peltier::continuous(&mut ngu401(cfg)?, &mut sensor, &mut clock, &cfg.peltier_continuous)?;
            save(&trace.into_archive(), &path)?;
        }
        Command::PeltierPulse(out) => {
            let path = out.or(&cfg.peltier_pulse.output);
            let mut sensor = temperature_sensor(cfg)?;
            let trace = peltier::pulse(&mut ngu401(cfg)?, &mut sensor, &mut clock, &cfg.peltier_pulse, &cfg.fastlog)?;
            save(&trace.into_archive(), &path)?;
        }
        Command::PeltierPwm(out) => {
            let path = out.or(&cfg.peltier_pwm.output);
            let mut sensor = temperature_sensor(cfg)?;
            let trace = peltier::pwm(&mut ngu401(cfg)?, &mut sensor, &mut clock, &cfg.peltier_pwm, &cfg.fastlog)?;
            save(&trace.into_archive(), &path)?;
        }
        Command::RegulationLoad(out) => {
            let path = out.or(&cfg.regulation_load.output);
            let transient = regulation::load(&mut ngu401(cfg)?, &mut clock, &cfg.regulation_load, &cfg.fastlog)?;
            save(&transient.into_archive(), &path)?;
        }
        Command::RegulationCpm(out) => {
            let path = out.or(&cfg.regulation_cpm.output);
            let transient = regulation::cpm(&mut ngu401(cfg)?, &mut clock, &cfg.regulation_cpm, &cfg.fastlog)?;
            save(&transient.into_archive(), &path)?;
        }
        Command::Modulation(out) => {
            let path = out.or(&cfg.modulation.output);
            let voltage = regulation::modulation(&mut ngu401(cfg)?, &mut clock, &cfg.modulation, &cfg.fastlog)?;
            save_npy(&path, &voltage).with_context(|| format!("saving {}", path.display()))?;
        }
        Command::Solar(out) => {
            let path = out.or(&cfg.solar.output);
            let curve = solar::sweep(&mut ngu401(cfg)?, &mut clock, &cfg.solar)?;
            save(&curve.into_archive(), &path)?;
        }

        Command::PlotConverter { input, title } => {
            let input = input.unwrap_or_else(|| cfg.converter.output.clone());
            let map = EfficiencyMap::from_archive(&load(&input)?)?;
            let title = title.unwrap_or_else(|| stem(&input));
            plot::converter::render_all(&map, &input, &title, size)?;
        }
        Command::PlotPower { smu, scope } => {
            let smu = smu.unwrap_or_else(|| cfg.power.output.clone());
            let scope = scope.unwrap_or_else(|| smu.with_file_name("scope.npz"));
            let record = PowerRecord::from_archives(&load(&smu)?, &load(&scope)?, cfg.plot.scope_rate_hz)?;
            for phase in record.phases()? {
                info!("{}", phase);
            }
            plot::power::render_raw(&record, &smu.with_file_name("raw.png"), size)?;
            plot::power::render_power(&record, &smu.with_file_name("power.png"), size)?;
        }
        Command::PlotPeltier { step, pulse, pwm, out_dir } => {
            let step = step.unwrap_or_else(|| cfg.peltier_continuous.output.clone());
            let pulse = pulse.unwrap_or_else(|| cfg.peltier_pulse.output.clone());
            let pwm = pwm.unwrap_or_else(|| cfg.peltier_pwm.output.clone());
            let out_dir = out_dir
                .or_else(|| step.parent().map(Path::to_path_buf))
                .unwrap_or_default();
            plot::peltier::render_all(
                &PeltierTrace::from_archive(&load(&step)?)?,
                &PeltierTrace::from_archive(&load(&pulse)?)?,
                &PwmTrace::from_archive(&load(&pwm)?)?,
                &cfg.plot,
                &out_dir,
            )?;
        }
        Command::PlotRegulation => {
            for job in &cfg.plot.regulation {
                plot::regulation::render_job(job, cfg.plot.calibrated_rate_hz, size)
                    .with_context(|| format!("plotting {}", job.input.display()))?;
            }
        }
        Command::PlotModulation { input, title } => {
            let input = input.unwrap_or_else(|| cfg.modulation.output.clone());
            let title = title.unwrap_or_else(|| stem(&input));
            plot::modulation::render_file(&input, cfg.plot.calibrated_rate_hz, &title, size)?;
        }
        Command::PlotChamber { input } => {
            plot::chamber::render_file(&input, size)
                .with_context(|| format!("plotting {}", input.display()))?;
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let cfg = Config::load(cli.config.as_deref())
        .with_context(|| format!("loading configuration {:?}", cli.config))?;
    debug!("{:?}", cfg);
    run(cli.command, &cfg)
}
