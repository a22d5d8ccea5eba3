//! Named numeric arrays on disk, in NumPy's `.npy` / `.npz` layout so the
//! recordings open directly in the usual analysis tools.
//!
//! Arrays are always written as little-endian `f64` in C order. The reader
//! also accepts the integer and `f32` dtypes oscilloscope exports use and
//! widens them to `f64`.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, Write};
use std::path::Path;

use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use log::*;
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while};
use nom::character::complete::{char, digit1, space0};
use nom::combinator::{map, map_res, opt, value};
use nom::multi::separated_list0;
use nom::sequence::{delimited, pair, preceded, tuple};
use nom::IResult;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{Error, Result};

const MAGIC: &[u8] = b"\x93NUMPY";
const ALIGN: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl NdArray {
    pub fn new(shape: Vec<usize>, data: Vec<f64>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(Error::archive(format!(
                "shape {:?} needs {} values, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(NdArray { shape, data })
    }

    pub fn vector(data: Vec<f64>) -> Self {
        NdArray {
            shape: vec![data.len()],
            data,
        }
    }

    pub fn scalar(v: f64) -> Self {
        NdArray {
            shape: Vec::new(),
            data: vec![v],
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Element at a C-order multi-index.
    pub fn get(&self, index: &[usize]) -> Option<f64> {
        if index.len() != self.shape.len() {
            return None;
        }
        let mut flat = 0;
        for (i, n) in index.iter().zip(&self.shape) {
            if i >= n {
                return None;
            }
            flat = flat * n + i;
        }
        self.data.get(flat).copied()
    }
}

impl From<Vec<f64>> for NdArray {
    fn from(data: Vec<f64>) -> Self {
        NdArray::vector(data)
    }
}

/// Ordered set of named arrays, one `.npz` file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Archive {
    arrays: Vec<(String, NdArray)>,
}

impl Archive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `array` under `name`, replacing an existing entry.
    pub fn insert(&mut self, name: &str, array: impl Into<NdArray>) -> &mut Self {
        let array = array.into();
        match self.arrays.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = array,
            None => self.arrays.push((name.to_string(), array)),
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&NdArray> {
        self.arrays.iter().find(|(n, _)| n == name).map(|(_, a)| a)
    }

    pub fn require(&self, name: &str) -> Result<&NdArray> {
        self.get(name)
            .ok_or_else(|| Error::archive(format!("array {:?} missing from archive", name)))
    }

    /// Flat data of a named array.
    pub fn vector(&self, name: &str) -> Result<&[f64]> {
        self.require(name).map(|a| a.data())
    }

    /// Flat data of each named array. All of them must hold the same number
    /// of values.
    pub fn columns(&self, names: &[&str]) -> Result<Vec<&[f64]>> {
        let columns = names
            .iter()
            .map(|name| self.vector(name))
            .collect::<Result<Vec<_>>>()?;
        for (name, column) in names.iter().zip(&columns).skip(1) {
            if column.len() != columns[0].len() {
                return Err(Error::archive(format!(
                    "{} holds {} values but {} holds {}",
                    name,
                    column.len(),
                    names[0],
                    columns[0].len()
                )));
            }
        }
        Ok(columns)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.arrays.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.arrays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arrays.is_empty()
    }

    pub fn write_to<W: Write + Seek>(&self, writer: W) -> Result<()> {
        let mut zip = ZipWriter::new(writer);
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Stored)
            .large_file(true);
        for (name, array) in &self.arrays {
            zip.start_file(format!("{}.npy", name), options)?;
            write_npy(&mut zip, array)?;
        }
        zip.finish()?;
        Ok(())
    }

    pub fn read_from<R: Read + Seek>(reader: R) -> Result<Self> {
        let mut zip = ZipArchive::new(reader)?;
        let mut archive = Archive::new();
        for i in 0..zip.len() {
            let mut entry = zip.by_index(i)?;
            let name = entry.name().trim_end_matches(".npy").to_string();
            let array = read_npy(&mut entry)?;
            archive.arrays.push((name, array));
        }
        Ok(archive)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        create_parent(path)?;
        self.write_to(BufWriter::new(File::create(path)?))?;
        info!(
            "Saved {} ({})",
            path.display(),
            self.names().collect::<Vec<_>>().join(", ")
        );
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let archive = Self::read_from(BufReader::new(File::open(path)?))?;
        debug!("Loaded {} arrays from {}", archive.len(), path.display());
        Ok(archive)
    }
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

pub fn save_npy<P: AsRef<Path>>(path: P, array: &NdArray) -> Result<()> {
    let path = path.as_ref();
    create_parent(path)?;
    let mut w = BufWriter::new(File::create(path)?);
    write_npy(&mut w, array)?;
    w.flush()?;
    info!("Saved {} ({:?})", path.display(), array.shape());
    Ok(())
}

pub fn load_npy<P: AsRef<Path>>(path: P) -> Result<NdArray> {
    read_npy(&mut BufReader::new(File::open(path)?))
}

fn shape_literal(shape: &[usize]) -> String {
    match shape {
        [] => "()".to_string(),
        [n] => format!("({},)", n),
        dims => format!(
            "({})",
            dims.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(", ")
        ),
    }
}

pub fn write_npy<W: Write>(w: &mut W, array: &NdArray) -> Result<()> {
    let mut header = format!(
        "{{'descr': '<f8', 'fortran_order': False, 'shape': {}, }}",
        shape_literal(array.shape())
    );
    // Magic, version and length field take 10 bytes; pad so the data starts
    // on an aligned offset and the header ends with a newline.
    let unpadded = MAGIC.len() + 4 + header.len() + 1;
    let pad = (ALIGN - unpadded % ALIGN) % ALIGN;
    header.push_str(&" ".repeat(pad));
    header.push('\n');

    w.write_all(MAGIC)?;
    w.write_all(&[1, 0])?;
    w.write_u16::<LittleEndian>(header.len() as u16)?;
    w.write_all(header.as_bytes())?;
    let mut raw = vec![0_u8; array.data().len() * 8];
    LittleEndian::write_f64_into(array.data(), &mut raw);
    w.write_all(&raw)?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
enum HeaderValue {
    Str(String),
    Bool(bool),
    Shape(Vec<usize>),
}

fn quoted(i: &str) -> IResult<&str, &str> {
    delimited(char('\''), take_while(|c| c != '\''), char('\''))(i)
}

fn shape(i: &str) -> IResult<&str, Vec<usize>> {
    delimited(
        pair(char('('), space0),
        separated_list0(
            tuple((space0, char(','), space0)),
            map_res(digit1, |d: &str| d.parse::<usize>()),
        ),
        tuple((space0, opt(char(',')), space0, char(')'))),
    )(i)
}

fn header_value(i: &str) -> IResult<&str, HeaderValue> {
    alt((
        map(quoted, |s| HeaderValue::Str(s.to_string())),
        value(HeaderValue::Bool(true), tag("True")),
        value(HeaderValue::Bool(false), tag("False")),
        map(shape, HeaderValue::Shape),
    ))(i)
}

fn header_entry(i: &str) -> IResult<&str, (&str, HeaderValue)> {
    map(
        tuple((space0, quoted, space0, char(':'), space0, header_value)),
        |(_, key, _, _, _, v)| (key, v),
    )(i)
}

fn header_dict(i: &str) -> IResult<&str, Vec<(&str, HeaderValue)>> {
    preceded(
        space0,
        delimited(
            char('{'),
            separated_list0(pair(space0, char(',')), header_entry),
            tuple((space0, opt(char(',')), space0, char('}'))),
        ),
    )(i)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Kind {
    Float,
    Int,
    Uint,
    Bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Dtype {
    big_endian: bool,
    kind: Kind,
    size: usize,
}

fn parse_descr(descr: &str) -> Result<Dtype> {
    let mut chars = descr.chars();
    let order = chars.next();
    let kind = chars.next();
    let size: usize = chars
        .as_str()
        .parse()
        .map_err(|_| Error::archive(format!("unsupported dtype {:?}", descr)))?;
    let big_endian = match order {
        Some('<') | Some('|') | Some('=') => false,
        Some('>') => true,
        _ => return Err(Error::archive(format!("unsupported dtype {:?}", descr))),
    };
    let kind = match (kind, size) {
        (Some('f'), 4) | (Some('f'), 8) => Kind::Float,
        (Some('i'), 1) | (Some('i'), 2) | (Some('i'), 4) | (Some('i'), 8) => Kind::Int,
        (Some('u'), 1) | (Some('u'), 2) | (Some('u'), 4) | (Some('u'), 8) => Kind::Uint,
        (Some('b'), 1) => Kind::Bool,
        _ => return Err(Error::archive(format!("unsupported dtype {:?}", descr))),
    };
    Ok(Dtype {
        big_endian,
        kind,
        size,
    })
}

fn decode<B: ByteOrder>(raw: &[u8], dtype: Dtype) -> Vec<f64> {
    let n = raw.len() / dtype.size;
    match (dtype.kind, dtype.size) {
        (Kind::Float, 8) => {
            let mut out = vec![0.0; n];
            B::read_f64_into(raw, &mut out);
            out
        }
        (Kind::Float, _) => {
            let mut out = vec![0.0_f32; n];
            B::read_f32_into(raw, &mut out);
            out.into_iter().map(f64::from).collect()
        }
        (Kind::Int, 1) => raw.iter().map(|&b| b as i8 as f64).collect(),
        (Kind::Uint, 1) | (Kind::Bool, _) => raw.iter().map(|&b| b as f64).collect(),
        (Kind::Int, 2) => raw.chunks_exact(2).map(|c| B::read_i16(c) as f64).collect(),
        (Kind::Int, 4) => raw.chunks_exact(4).map(|c| B::read_i32(c) as f64).collect(),
        (Kind::Int, _) => raw.chunks_exact(8).map(|c| B::read_i64(c) as f64).collect(),
        (Kind::Uint, 2) => raw.chunks_exact(2).map(|c| B::read_u16(c) as f64).collect(),
        (Kind::Uint, 4) => raw.chunks_exact(4).map(|c| B::read_u32(c) as f64).collect(),
        (Kind::Uint, _) => raw.chunks_exact(8).map(|c| B::read_u64(c) as f64).collect(),
    }
}

pub fn read_npy<R: Read>(r: &mut R) -> Result<NdArray> {
    let mut magic = [0_u8; 6];
    r.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(Error::archive("not an .npy stream"));
    }
    let major = r.read_u8()?;
    let _minor = r.read_u8()?;
    let header_len = match major {
        1 => r.read_u16::<LittleEndian>()? as usize,
        2 | 3 => r.read_u32::<LittleEndian>()? as usize,
        v => return Err(Error::archive(format!("unsupported .npy version {}", v))),
    };
    let mut header = vec![0_u8; header_len];
    r.read_exact(&mut header)?;
    let header = String::from_utf8_lossy(&header);

    let (_, entries) = header_dict(&header)
        .map_err(|e| Error::archive(format!("malformed .npy header: {:?}", e)))?;
    let mut descr = None;
    let mut fortran = false;
    let mut dims = None;
    for (key, v) in entries {
        match (key, v) {
            ("descr", HeaderValue::Str(s)) => descr = Some(s),
            ("fortran_order", HeaderValue::Bool(b)) => fortran = b,
            ("shape", HeaderValue::Shape(s)) => dims = Some(s),
            (k, v) => trace!("ignoring .npy header entry {} = {:?}", k, v),
        }
    }
    let descr = descr.ok_or_else(|| Error::archive("header without descr"))?;
    let dims = dims.ok_or_else(|| Error::archive("header without shape"))?;
    if fortran && dims.len() > 1 {
        return Err(Error::archive("Fortran ordered arrays are not supported"));
    }

    let dtype = parse_descr(&descr)?;
    let len = dims
        .iter()
        .try_fold(dtype.size, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| Error::archive("shape overflows"))?;
    let mut raw = Vec::new();
    r.by_ref().take(len as u64).read_to_end(&mut raw)?;
    if raw.len() != len {
        return Err(Error::archive(format!(
            "payload holds {} of {} bytes",
            raw.len(),
            len
        )));
    }
    let data = if dtype.big_endian {
        decode::<BigEndian>(&raw, dtype)
    } else {
        decode::<LittleEndian>(&raw, dtype)
    };
    NdArray::new(dims, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn npy_bytes(array: &NdArray) -> Vec<u8> {
        let mut buf = Vec::new();
        write_npy(&mut buf, array).unwrap();
        buf
    }

    #[test]
    fn header_is_aligned_and_readable() {
        let bytes = npy_bytes(&NdArray::vector(vec![1.0, 2.5, -3.0]));
        let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
        assert_eq!((10 + header_len) % 64, 0);
        assert_eq!(bytes[10 + header_len - 1], b'\n');
        let header = std::str::from_utf8(&bytes[10..10 + header_len]).unwrap();
        assert!(header.starts_with("{'descr': '<f8', 'fortran_order': False, 'shape': (3,), }"));
        assert_eq!(bytes.len(), 10 + header_len + 24);
    }

    #[test]
    fn shape_literals() {
        assert_eq!(shape_literal(&[]), "()");
        assert_eq!(shape_literal(&[7]), "(7,)");
        assert_eq!(shape_literal(&[50, 50, 4]), "(50, 50, 4)");
    }

    #[test]
    fn parses_numpy_written_header() {
        let (_, entries) =
            header_dict("{'descr': '<i2', 'fortran_order': False, 'shape': (4, 2), }    \n").unwrap();
        assert_eq!(entries[0], ("descr", HeaderValue::Str("<i2".into())));
        assert_eq!(entries[1], ("fortran_order", HeaderValue::Bool(false)));
        assert_eq!(entries[2], ("shape", HeaderValue::Shape(vec![4, 2])));
    }

    #[test]
    fn reads_integer_scope_channels() {
        let header = "{'descr': '|i1', 'fortran_order': False, 'shape': (4,), }";
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&[1, 0]);
        bytes.extend_from_slice(&(header.len() as u16 + 1).to_le_bytes());
        bytes.extend_from_slice(header.as_bytes());
        bytes.push(b'\n');
        bytes.extend_from_slice(&[0x00, 0x7f, 0x80, 0xff]);
        let array = read_npy(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(array.data(), &[0.0, 127.0, -128.0, -1.0]);
    }

    fn npy_with_header(header: &str, payload: &[u8]) -> Vec<u8> {
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&[1, 0]);
        bytes.extend_from_slice(&(header.len() as u16 + 1).to_le_bytes());
        bytes.extend_from_slice(header.as_bytes());
        bytes.push(b'\n');
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn rejects_overflowing_shape() {
        let header = "{'descr': '<f8', 'fortran_order': False, 'shape': (4294967296, 4294967296), }";
        let bytes = npy_with_header(header, &[0; 16]);
        assert!(read_npy(&mut Cursor::new(bytes)).is_err());
    }

    #[test]
    fn rejects_short_payload() {
        let header = "{'descr': '<f8', 'fortran_order': False, 'shape': (1099511627776,), }";
        let bytes = npy_with_header(header, &[0; 16]);
        assert!(read_npy(&mut Cursor::new(bytes)).is_err());

        let header = "{'descr': '<f8', 'fortran_order': False, 'shape': (3,), }";
        let bytes = npy_with_header(header, &[0; 16]);
        assert!(read_npy(&mut Cursor::new(bytes)).is_err());
    }

    #[test]
    fn multi_dimensional_indexing() {
        let data: Vec<f64> = (0..24).map(f64::from).collect();
        let array = NdArray::new(vec![2, 3, 4], data).unwrap();
        assert_eq!(array.get(&[1, 2, 3]), Some(23.0));
        assert_eq!(array.get(&[0, 1, 0]), Some(4.0));
        assert_eq!(array.get(&[2, 0, 0]), None);
        assert!(NdArray::new(vec![2, 2], vec![1.0]).is_err());
    }

    #[test]
    fn npz_keeps_names_and_shapes() {
        let mut archive = Archive::new();
        archive
            .insert("vBuffer", vec![1.0, 2.0, 3.0])
            .insert("iBuffer", vec![0.1, 0.2, 0.3])
            .insert("rate", NdArray::scalar(499_871.5));
        let mut buf = Cursor::new(Vec::new());
        archive.write_to(&mut buf).unwrap();

        buf.set_position(0);
        let back = Archive::read_from(buf).unwrap();
        assert_eq!(back.names().collect::<Vec<_>>(), vec!["vBuffer", "iBuffer", "rate"]);
        assert_eq!(back.vector("iBuffer").unwrap(), &[0.1, 0.2, 0.3]);
        assert_eq!(back.require("rate").unwrap().shape(), &[] as &[usize]);
        assert!(back.require("tBuffer").is_err());
    }

    #[test]
    fn insert_replaces_existing() {
        let mut archive = Archive::new();
        archive.insert("x", vec![1.0]).insert("x", vec![2.0]);
        assert_eq!(archive.len(), 1);
        assert_eq!(archive.vector("x").unwrap(), &[2.0]);
    }

    #[test]
    fn columns_share_a_length() {
        let mut archive = Archive::new();
        archive
            .insert("vBuffer", vec![1.0, 2.0, 3.0])
            .insert("iBuffer", vec![0.1, 0.2, 0.3])
            .insert("tBuffer", vec![20.0]);
        let columns = archive.columns(&["vBuffer", "iBuffer"]).unwrap();
        assert_eq!(columns[1], &[0.1, 0.2, 0.3]);
        assert!(archive.columns(&["vBuffer", "tBuffer"]).is_err());
        assert!(archive.columns(&["vBuffer", "tmBuffer"]).is_err());
    }

    #[test]
    fn files_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/modulation.npy");
        save_npy(&path, &NdArray::vector(vec![0.5, -0.5])).unwrap();
        assert_eq!(load_npy(&path).unwrap().data(), &[0.5, -0.5]);

        let npz = dir.path().join("power.npz");
        let mut archive = Archive::new();
        archive.insert("vBuffer", vec![5.0; 10]);
        archive.save(&npz).unwrap();
        assert_eq!(Archive::load(&npz).unwrap().vector("vBuffer").unwrap().len(), 10);
    }

    #[test]
    fn rejects_foreign_streams() {
        assert!(read_npy(&mut Cursor::new(b"PK\x03\x04 not npy".to_vec())).is_err());
        assert!(parse_descr("<c16").is_err());
        assert!(parse_descr(">f4").unwrap().big_endian);
    }
}
