use bytes::Bytes;
use log::error;
use std::fmt;

/// Type tag of a [`PropertyValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyType {
    Bool,
    SInt,
    UInt,
    LSInt,
    LUInt,
    Fraction,
    Float,
    Double,
    Vec2i,
    Vec2,
    Vec3i,
    Vec3,
    String,
    Name,
    Data,
    ConstData,
}

impl PropertyType {
    pub fn name(&self) -> &'static str {
        match self {
            PropertyType::Bool => "bool",
            PropertyType::SInt => "sint",
            PropertyType::UInt => "uint",
            PropertyType::LSInt => "lsint",
            PropertyType::LUInt => "luint",
            PropertyType::Fraction => "frac",
            PropertyType::Float => "float",
            PropertyType::Double => "number",
            PropertyType::Vec2i => "vec2i",
            PropertyType::Vec2 => "vec2",
            PropertyType::Vec3i => "vec3i",
            PropertyType::Vec3 => "vec3",
            PropertyType::String => "string",
            PropertyType::Name => "name",
            PropertyType::Data => "data",
            PropertyType::ConstData => "const data",
        }
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Rational number, used for frame rates, aspect ratios and durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fraction {
    pub num: i32,
    pub den: u32,
}

impl Fraction {
    pub const fn new(num: i32, den: u32) -> Self {
        Self { num, den }
    }

    /// `true` if both fractions describe the same ratio (`1/2` and `2/4`).
    pub fn same_ratio(&self, other: &Fraction) -> bool {
        self.num as i64 * other.den as i64 == other.num as i64 * self.den as i64
    }
}

impl fmt::Display for Fraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Typed property value.
///
/// String and data payloads are owned by the value: they are copied once
/// when the value is built and freed when the last entry holding it goes away.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    SInt(i32),
    UInt(u32),
    LSInt(i64),
    LUInt(u64),
    Fraction(Fraction),
    Float(f32),
    Double(f64),
    Vec2i(i32, i32),
    Vec2(f64, f64),
    Vec3i(i32, i32, i32),
    Vec3(f64, f64, f64),
    String(String),
    Name(String),
    Data(Bytes),
    ConstData(&'static [u8]),
}

impl PropertyValue {
    /// Builds a data value holding a private copy of `data`.
    pub fn data(data: &[u8]) -> Self {
        PropertyValue::Data(Bytes::copy_from_slice(data))
    }

    pub fn property_type(&self) -> PropertyType {
        match self {
            PropertyValue::Bool(_) => PropertyType::Bool,
            PropertyValue::SInt(_) => PropertyType::SInt,
            PropertyValue::UInt(_) => PropertyType::UInt,
            PropertyValue::LSInt(_) => PropertyType::LSInt,
            PropertyValue::LUInt(_) => PropertyType::LUInt,
            PropertyValue::Fraction(_) => PropertyType::Fraction,
            PropertyValue::Float(_) => PropertyType::Float,
            PropertyValue::Double(_) => PropertyType::Double,
            PropertyValue::Vec2i(..) => PropertyType::Vec2i,
            PropertyValue::Vec2(..) => PropertyType::Vec2,
            PropertyValue::Vec3i(..) => PropertyType::Vec3i,
            PropertyValue::Vec3(..) => PropertyType::Vec3,
            PropertyValue::String(_) => PropertyType::String,
            PropertyValue::Name(_) => PropertyType::Name,
            PropertyValue::Data(_) => PropertyType::Data,
            PropertyValue::ConstData(_) => PropertyType::ConstData,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_uint(&self) -> Option<u32> {
        match self {
            PropertyValue::UInt(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_sint(&self) -> Option<i32> {
        match self {
            PropertyValue::SInt(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_luint(&self) -> Option<u64> {
        match self {
            PropertyValue::LUInt(v) => Some(*v),
            PropertyValue::UInt(v) => Some(*v as u64),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            PropertyValue::Double(v) => Some(*v),
            PropertyValue::Float(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_fraction(&self) -> Option<Fraction> {
        match self {
            PropertyValue::Fraction(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) | PropertyValue::Name(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_data(&self) -> Option<&[u8]> {
        match self {
            PropertyValue::Data(d) => Some(d),
            PropertyValue::ConstData(d) => Some(d),
            _ => None,
        }
    }

    /// Parses a textual value of type `ty`.
    ///
    /// Malformed input is logged and replaced by the zero value of the type,
    /// so a bad filter argument never aborts filter creation.
    ///
    /// # Arguments
    /// * `ty` - target type
    /// * `name` - property or argument name, used in log messages only
    /// * `value` - text to parse; `None` means "flag present without value"
    /// * `enum_values` - `a|b|c` list for enumerated unsigned values, the
    ///   result is the index of `value` in the list
    pub fn parse(
        ty: PropertyType,
        name: &str,
        value: Option<&str>,
        enum_values: Option<&str>,
    ) -> PropertyValue {
        let text = value.map(str::trim);
        match ty {
            PropertyType::Bool => match text {
                None | Some("yes") | Some("true") | Some("1") => PropertyValue::Bool(true),
                Some("no") | Some("false") | Some("0") => PropertyValue::Bool(false),
                Some(other) => {
                    error!("Wrong argument value {other} for boolean arg {name} - using false");
                    PropertyValue::Bool(false)
                }
            },
            PropertyType::SInt => {
                PropertyValue::SInt(parse_or_zero(text, name, "int", |s| s.parse().ok()))
            }
            PropertyType::UInt => {
                let enum_list = enum_values.filter(|e| e.contains('|'));
                PropertyValue::UInt(parse_or_zero(text, name, "unsigned int", |s| {
                    match enum_list {
                        Some(list) => list.split('|').position(|v| v == s).map(|i| i as u32),
                        None => parse_hex_or_dec(s),
                    }
                }))
            }
            PropertyType::LSInt => {
                PropertyValue::LSInt(parse_or_zero(text, name, "long int", |s| s.parse().ok()))
            }
            PropertyType::LUInt => PropertyValue::LUInt(parse_or_zero(
                text,
                name,
                "long unsigned int",
                |s| s.parse().ok(),
            )),
            PropertyType::Fraction => PropertyValue::Fraction(
                text.and_then(parse_fraction).unwrap_or_else(|| {
                    error!(
                        "Wrong argument value {} for fraction arg {name} - using 0/1",
                        text.unwrap_or("")
                    );
                    Fraction::new(0, 1)
                }),
            ),
            PropertyType::Float => {
                PropertyValue::Float(parse_or_zero(text, name, "float", |s| s.parse().ok()))
            }
            PropertyType::Double => {
                PropertyValue::Double(parse_or_zero(text, name, "double", |s| s.parse().ok()))
            }
            PropertyType::Vec2i => {
                let v = parse_vector::<i32, 2>(text, name, "vec2i");
                PropertyValue::Vec2i(v[0], v[1])
            }
            PropertyType::Vec2 => {
                let v = parse_vector::<f64, 2>(text, name, "vec2");
                PropertyValue::Vec2(v[0], v[1])
            }
            PropertyType::Vec3i => {
                let v = parse_vector::<i32, 3>(text, name, "vec3i");
                PropertyValue::Vec3i(v[0], v[1], v[2])
            }
            PropertyType::Vec3 => {
                let v = parse_vector::<f64, 3>(text, name, "vec3");
                PropertyValue::Vec3(v[0], v[1], v[2])
            }
            // names are plain strings once parsed
            PropertyType::String | PropertyType::Name => {
                PropertyValue::String(value.unwrap_or_default().to_string())
            }
            PropertyType::Data | PropertyType::ConstData => match text {
                Some(s) if s.starts_with("0x") || s.starts_with("0X") => match decode_hex(&s[2..]) {
                    Some(bytes) => PropertyValue::Data(Bytes::from(bytes)),
                    None => {
                        error!("Wrong argument value {s} for data arg {name} - using empty data");
                        PropertyValue::Data(Bytes::new())
                    }
                },
                Some(s) => PropertyValue::data(s.as_bytes()),
                None => {
                    error!("Missing argument value for data arg {name} - using empty data");
                    PropertyValue::Data(Bytes::new())
                }
            },
        }
    }

    /// Property equality as used for capability matching.
    ///
    /// Fractions compare by ratio. A string `other` of `*` matches any
    /// string, and `a|b|c` matches any of the listed alternatives. Strings
    /// and names compare with each other, so do owned and constant data.
    pub fn matches(&self, other: &PropertyValue) -> bool {
        use PropertyValue::*;
        match (self, other) {
            (Fraction(a), Fraction(b)) => a.same_ratio(b),
            (String(a) | Name(a), String(b) | Name(b)) => {
                if b == "*" {
                    true
                } else if b.contains('|') {
                    b.split('|').any(|alt| alt == a)
                } else {
                    a == b
                }
            }
            (Data(_) | ConstData(_), Data(_) | ConstData(_)) => self.as_data() == other.as_data(),
            _ => self == other,
        }
    }
}

fn parse_or_zero<T: Default>(
    text: Option<&str>,
    name: &str,
    kind: &str,
    parse: impl FnOnce(&str) -> Option<T>,
) -> T {
    match text.and_then(parse) {
        Some(v) => v,
        None => {
            error!(
                "Wrong argument value {} for {kind} arg {name} - using 0",
                text.unwrap_or("")
            );
            T::default()
        }
    }
}

fn parse_hex_or_dec(s: &str) -> Option<u32> {
    if s.len() > 2 && s[..2].eq_ignore_ascii_case("0x") {
        u32::from_str_radix(&s[2..], 16).ok()
    } else {
        s.parse().ok()
    }
}

fn parse_fraction(s: &str) -> Option<Fraction> {
    if let Some((num, den)) = s.split_once('/') {
        return Some(Fraction::new(num.trim().parse().ok()?, den.trim().parse().ok()?));
    }
    // "num-den", keeping a leading minus sign on the numerator
    if let Some(pos) = s[1.min(s.len())..].find('-').map(|p| p + 1) {
        let (num, den) = (&s[..pos], &s[pos + 1..]);
        if let (Ok(num), Ok(den)) = (num.parse(), den.parse()) {
            return Some(Fraction::new(num, den));
        }
    }
    s.parse().ok().map(|num| Fraction::new(num, 1))
}

fn parse_vector<T, const N: usize>(text: Option<&str>, name: &str, kind: &str) -> [T; N]
where
    T: std::str::FromStr + Default + Copy,
{
    let parsed = text.and_then(|s| {
        let parts: Vec<&str> = s.split('x').collect();
        if parts.len() != N {
            return None;
        }
        let mut out = [T::default(); N];
        for (slot, part) in out.iter_mut().zip(parts) {
            *slot = part.trim().parse().ok()?;
        }
        Some(out)
    });
    parsed.unwrap_or_else(|| {
        error!(
            "Wrong argument value {} for {kind} arg {name} - using zero vector",
            text.unwrap_or("")
        );
        [T::default(); N]
    })
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(v) => write!(f, "{v}"),
            PropertyValue::SInt(v) => write!(f, "{v}"),
            PropertyValue::UInt(v) => write!(f, "{v}"),
            PropertyValue::LSInt(v) => write!(f, "{v}"),
            PropertyValue::LUInt(v) => write!(f, "{v}"),
            PropertyValue::Fraction(v) => write!(f, "{v}"),
            PropertyValue::Float(v) => write!(f, "{v}"),
            PropertyValue::Double(v) => write!(f, "{v}"),
            PropertyValue::Vec2i(x, y) => write!(f, "{x}x{y}"),
            PropertyValue::Vec2(x, y) => write!(f, "{x}x{y}"),
            PropertyValue::Vec3i(x, y, z) => write!(f, "{x}x{y}x{z}"),
            PropertyValue::Vec3(x, y, z) => write!(f, "{x}x{y}x{z}"),
            PropertyValue::String(s) | PropertyValue::Name(s) => f.write_str(s),
            PropertyValue::Data(d) => write!(f, "{} bytes", d.len()),
            PropertyValue::ConstData(d) => write!(f, "{} bytes", d.len()),
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<i32> for PropertyValue {
    fn from(v: i32) -> Self {
        PropertyValue::SInt(v)
    }
}

impl From<u32> for PropertyValue {
    fn from(v: u32) -> Self {
        PropertyValue::UInt(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::LSInt(v)
    }
}

impl From<u64> for PropertyValue {
    fn from(v: u64) -> Self {
        PropertyValue::LUInt(v)
    }
}

impl From<f32> for PropertyValue {
    fn from(v: f32) -> Self {
        PropertyValue::Float(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Double(v)
    }
}

impl From<Fraction> for PropertyValue {
    fn from(v: Fraction) -> Self {
        PropertyValue::Fraction(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::String(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::String(v)
    }
}

impl From<Bytes> for PropertyValue {
    fn from(v: Bytes) -> Self {
        PropertyValue::Data(v)
    }
}
