/// SI prefixes from pico to tera, by power of ten.
const PREFIXES: [(i32, &str); 9] = [
    (-12, "p"),
    (-9, "n"),
    (-6, "µ"),
    (-3, "m"),
    (0, ""),
    (3, "k"),
    (6, "M"),
    (9, "G"),
    (12, "T"),
];

fn decade(value: f64) -> i32 {
    value.abs().log10().floor() as i32
}

fn round_significant(value: f64, digits: usize) -> f64 {
    let scale = 10_f64.powi(digits as i32 - 1 - decade(value));
    if scale.is_finite() && scale > 0.0 {
        (value * scale).round() / scale
    } else {
        value
    }
}

/// Formats `value` with `digits` significant digits and an SI prefix so the
/// mantissa lies in [1, 1000).
///
/// ```
/// use lab_bench::metric::metric;
/// assert_eq!(metric(0.01234, 3, "A"), "12.3 mA");
/// assert_eq!(metric(4.2e3, 2, "W"), "4.2 kW");
/// ```
pub fn metric(value: f64, digits: usize, unit: &str) -> String {
    let digits = digits.max(1);
    if value == 0.0 {
        return format!("{:.*} {}", digits - 1, 0.0, unit);
    }
    if !value.is_finite() {
        return format!("{} {}", value, unit);
    }

    // Round first so 999.96 becomes 1.00 k rather than 1000 with no prefix.
    let rounded = round_significant(value, digits);
    let magnitude = decade(rounded);
    let exponent = (magnitude.div_euclid(3) * 3).clamp(-12, 12);
    let prefix = PREFIXES
        .iter()
        .find(|(e, _)| *e == exponent)
        .map_or("", |&(_, p)| p);
    let mantissa = rounded / 10_f64.powi(exponent);
    let int_digits = magnitude - exponent + 1;
    let decimals = (digits as i32 - int_digits).max(0) as usize;

    format!("{:.*} {}{}", decimals, mantissa, prefix, unit)
}
