//! Represent CA DBR representations, for data interchange.
//!
//! CA defines thirty-five [DBR] kinds as special structures used to transfer data back
//! and forth. These can be broken down into seven basic array types, which define the
//! data, and five categories of attached metadata. This module models this, and
//! provides decoding of everything a server can send, along with encoding of the
//! values a client writes.
//!
//! The basic types are enumerated in [`DbrBasicType`] and are represented in
//! [`DbrValue`]. All numeric data types in CA are signed. The options, and the native
//! type used to represent, are:
//! - [`DbrValue::Char`] ([`Vec<i8>`])
//! - [`DbrValue::Int`] ([`Vec<i16>`])
//! - [`DbrValue::Long`] ([`Vec<i32>`])
//! - [`DbrValue::Float`] ([`Vec<f32>`])
//! - [`DbrValue::Double`] ([`Vec<f64>`])
//! - [`DbrValue::Enum`] ([`Vec<u16>`]) holding indices into the state strings that
//!   arrive with [`DbrGraphics::Enum`].
//! - [`DbrValue::String`] - natively in CA this is a `[u8; 40]`, but for interchange
//!   here is represented by [`Vec<String>`], and is converted back and forth to
//!   fixed-length as required for communication.
//!
//! The protocol also defines `SHORT` as an alias for `INT` - this is ignored here to
//! avoid excessive confusion.
//!
//! In CA, these seven data types can be sent with five kinds of metadata attached.
//! These are enumerated by [`DbrCategory`] and represented by [`Dbr`]:
//! - [`Dbr::Basic`] - No extra metadata included, just the plain data value.
//! - [`Dbr::Status`] - Alarm status and severity in addition to the data.
//! - [`Dbr::Time`] - All of the information from [`Dbr::Status`], with a timestamp.
//! - [`Dbr::Graphics`] - Display information: units, precision, display/alarm/warning
//!   limits, or the state strings of an enum.
//! - [`Dbr::Control`] - Everything in graphics, plus the control limits.
//!
//! [`Dbr::ClassName`] additionally returns the EPICS record type for the PV.
//!
//! [DBR]:
//!     https://docs.epics-controls.org/en/latest/internal/ca_protocol.html#payload-data-types
//!
use nom::{
    IResult, Parser,
    bytes::complete::take,
    multi::count,
    number::complete::{be_f32, be_f64, be_i8, be_i16, be_i32, be_u16, be_u32},
};
use num::{NumCast, cast::AsPrimitive, traits::ToBytes};
use std::{
    cmp,
    convert::TryFrom,
    fmt::Debug,
    io::{self, Cursor},
    num::NonZeroUsize,
    str::FromStr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crate::messages::{ErrorCondition, MessageError};

// Constants from EPICS
const MAX_STRING_SIZE: usize = 40;
const MAX_UNITS_SIZE: usize = 8;
const MAX_ENUM_STRING_SIZE: usize = 26;
const MAX_ENUM_STATES: usize = 16;
/// Seconds between the UNIX epoch and the EPICS epoch (1990-01-01)
const EPICS_EPOCH_OFFSET: u64 = 631152000;

/// Encode a String to a fixed-maximum-length byte array
///
/// We want to convert a string to a byte sequence but never a length >
/// the fixed length of the field, and we can't convert and truncate because
/// non-ASCII is technically possible. So, convert one-character-at-a-time
/// until the length would go over.
fn string_to_fixed_length_bytes(value: &str, max_length: usize) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(max_length);
    for c in value.chars() {
        if buffer.len() + c.len_utf8() < max_length {
            let mut char_buffer = [0u8; 4];
            buffer.extend_from_slice(c.encode_utf8(&mut char_buffer).as_bytes());
        } else {
            break;
        }
    }
    buffer.resize(max_length, 0);
    buffer
}

/// Read a NUL-terminated string out of a fixed-size field
fn fixed_length_bytes_to_string(data: &[u8]) -> String {
    let strlen = data.iter().position(|&c| c == 0x00).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..strlen]).into_owned()
}

fn malformed(data_type: DbrType) -> MessageError {
    MessageError::Malformed(format!("DBR payload too short for {data_type:?}"))
}

/// Represent actual data transferred over CA
#[derive(Clone, Debug, PartialEq)]
pub enum DbrValue {
    Enum(Vec<u16>),
    String(Vec<String>),
    Char(Vec<i8>),
    Int(Vec<i16>),
    Long(Vec<i32>),
    Float(Vec<f32>),
    Double(Vec<f64>),
}

impl DbrValue {
    pub fn get_count(&self) -> usize {
        match self {
            DbrValue::Enum(val) => val.len(),
            DbrValue::String(val) => val.len(),
            DbrValue::Char(val) => val.len(),
            DbrValue::Int(val) => val.len(),
            DbrValue::Long(val) => val.len(),
            DbrValue::Float(val) => val.len(),
            DbrValue::Double(val) => val.len(),
        }
    }
    pub fn get_type(&self) -> DbrBasicType {
        match self {
            DbrValue::Enum(_) => DbrBasicType::Enum,
            DbrValue::String(_) => DbrBasicType::String,
            DbrValue::Char(_) => DbrBasicType::Char,
            DbrValue::Int(_) => DbrBasicType::Int,
            DbrValue::Long(_) => DbrBasicType::Long,
            DbrValue::Float(_) => DbrBasicType::Float,
            DbrValue::Double(_) => DbrBasicType::Double,
        }
    }

    pub fn convert_to(&self, basic_type: DbrBasicType) -> Result<DbrValue, ErrorCondition> {
        /// Utility function so that we don't have to repeat the map iter conversion
        fn _try_convert_vec<T, U>(from: &[T]) -> Result<Vec<U>, ErrorCondition>
        where
            T: Copy + NumCast,
            U: NumCast,
        {
            from.iter()
                .map(|n| NumCast::from(*n).ok_or(ErrorCondition::NoConvert))
                .collect()
        }
        /// Convert a single-item string to a numeric array
        fn _encode_string<T>(from: &[String]) -> Result<Vec<T>, ErrorCondition>
        where
            T: Copy + 'static,
            u8: AsPrimitive<T>,
        {
            Ok(match from {
                [] => Vec::new(),
                [val] => val.as_bytes().iter().map(|c| c.as_()).collect(),
                _ => Err(ErrorCondition::NoConvert)?,
            })
        }
        fn _format_vec<T: ToString>(from: &[T]) -> Vec<String> {
            from.iter().map(|v| v.to_string()).collect()
        }

        Ok(match basic_type {
            DbrBasicType::Char => match self {
                DbrValue::Char(_val) => self.clone(),
                DbrValue::Int(val) => DbrValue::Char(_try_convert_vec(val)?),
                DbrValue::Long(val) => DbrValue::Char(_try_convert_vec(val)?),
                DbrValue::Float(val) => DbrValue::Char(_try_convert_vec(val)?),
                DbrValue::Double(val) => DbrValue::Char(_try_convert_vec(val)?),
                DbrValue::Enum(val) => DbrValue::Char(_try_convert_vec(val)?),
                DbrValue::String(val) => DbrValue::Char(_encode_string(val)?),
            },
            DbrBasicType::Int => match self {
                DbrValue::Char(val) => DbrValue::Int(_try_convert_vec(val)?),
                DbrValue::Int(_val) => self.clone(),
                DbrValue::Long(val) => DbrValue::Int(_try_convert_vec(val)?),
                DbrValue::Float(val) => DbrValue::Int(_try_convert_vec(val)?),
                DbrValue::Double(val) => DbrValue::Int(_try_convert_vec(val)?),
                DbrValue::Enum(val) => DbrValue::Int(_try_convert_vec(val)?),
                DbrValue::String(val) => DbrValue::Int(_encode_string(val)?),
            },
            DbrBasicType::Long => match self {
                DbrValue::Char(val) => DbrValue::Long(_try_convert_vec(val)?),
                DbrValue::Int(val) => DbrValue::Long(_try_convert_vec(val)?),
                DbrValue::Long(_val) => self.clone(),
                DbrValue::Float(val) => DbrValue::Long(_try_convert_vec(val)?),
                DbrValue::Double(val) => DbrValue::Long(_try_convert_vec(val)?),
                DbrValue::Enum(val) => DbrValue::Long(_try_convert_vec(val)?),
                DbrValue::String(val) => DbrValue::Long(_encode_string(val)?),
            },
            DbrBasicType::Float => match self {
                DbrValue::Char(val) => DbrValue::Float(_try_convert_vec(val)?),
                DbrValue::Int(val) => DbrValue::Float(_try_convert_vec(val)?),
                DbrValue::Long(val) => DbrValue::Float(_try_convert_vec(val)?),
                DbrValue::Float(_val) => self.clone(),
                DbrValue::Double(val) => DbrValue::Float(_try_convert_vec(val)?),
                DbrValue::Enum(val) => DbrValue::Float(_try_convert_vec(val)?),
                DbrValue::String(val) => DbrValue::Float(_encode_string(val)?),
            },
            DbrBasicType::Double => match self {
                DbrValue::Char(val) => DbrValue::Double(_try_convert_vec(val)?),
                DbrValue::Int(val) => DbrValue::Double(_try_convert_vec(val)?),
                DbrValue::Long(val) => DbrValue::Double(_try_convert_vec(val)?),
                DbrValue::Float(val) => DbrValue::Double(_try_convert_vec(val)?),
                DbrValue::Double(_val) => self.clone(),
                DbrValue::Enum(val) => DbrValue::Double(_try_convert_vec(val)?),
                DbrValue::String(val) => DbrValue::Double(_encode_string(val)?),
            },
            DbrBasicType::Enum => match self {
                DbrValue::Enum(_val) => self.clone(),
                DbrValue::Char(val) => DbrValue::Enum(_try_convert_vec(val)?),
                DbrValue::Int(val) => DbrValue::Enum(_try_convert_vec(val)?),
                DbrValue::Long(val) => DbrValue::Enum(_try_convert_vec(val)?),
                DbrValue::Float(val) => DbrValue::Enum(_try_convert_vec(val)?),
                DbrValue::Double(val) => DbrValue::Enum(_try_convert_vec(val)?),
                // Mapping a state name to an index needs the enum strings
                DbrValue::String(_) => return Err(ErrorCondition::NoConvert),
            },
            DbrBasicType::String => match self {
                DbrValue::String(_) => self.clone(),
                DbrValue::Char(val) => DbrValue::String(vec![
                    String::from_utf8(
                        val.iter()
                            .take_while(|c| **c != 0)
                            .map(|c| *c as u8)
                            .collect(),
                    )
                    .map_err(|_| ErrorCondition::NoConvert)?,
                ]),
                DbrValue::Int(val) => DbrValue::String(_format_vec(val)),
                DbrValue::Long(val) => DbrValue::String(_format_vec(val)),
                DbrValue::Float(val) => DbrValue::String(_format_vec(val)),
                DbrValue::Double(val) => DbrValue::String(_format_vec(val)),
                DbrValue::Enum(val) => DbrValue::String(_format_vec(val)),
            },
        })
    }

    /// Encode the value contents of a DBR into a byte vector
    ///
    /// If max_elems is `None`, then all elements available will be returned.
    ///
    /// Returns the number of elements along with the bytes
    pub fn to_bytes(&self, max_elems: Option<NonZeroUsize>) -> (usize, Vec<u8>) {
        let elements = if let Some(max_elem) = max_elems {
            cmp::min(max_elem.into(), self.get_count())
        } else {
            self.get_count()
        };

        fn _encode<T: ToBytes + Copy>(values: &[T], elements: usize) -> Vec<u8> {
            values
                .iter()
                .take(elements)
                .flat_map(|v| v.to_be_bytes().as_ref().to_vec())
                .collect()
        }

        (
            elements,
            match self {
                DbrValue::Enum(val) => _encode(val, elements),
                DbrValue::String(val) => val
                    .iter()
                    .take(elements)
                    .flat_map(|v| string_to_fixed_length_bytes(v, MAX_STRING_SIZE))
                    .collect(),
                DbrValue::Char(val) => _encode(val, elements),
                DbrValue::Int(val) => _encode(val, elements),
                DbrValue::Long(val) => _encode(val, elements),
                DbrValue::Float(val) => _encode(val, elements),
                DbrValue::Double(val) => _encode(val, elements),
            },
        )
    }

    /// Decode `item_count` values of a basic type from the front of `data`
    pub fn decode_value(
        data_type: DbrBasicType,
        item_count: usize,
        data: &[u8],
    ) -> IResult<&[u8], DbrValue> {
        match data_type {
            DbrBasicType::Enum => {
                let (rest, values) = count(be_u16, item_count).parse(data)?;
                Ok((rest, DbrValue::Enum(values)))
            }
            // Servers may shorten the final string element, so accept partial chunks
            DbrBasicType::String => Ok((
                &data[cmp::min(data.len(), item_count * MAX_STRING_SIZE)..],
                DbrValue::String(
                    data.chunks(MAX_STRING_SIZE)
                        .take(item_count)
                        .map(fixed_length_bytes_to_string)
                        .collect(),
                ),
            )),
            DbrBasicType::Char => {
                let (rest, values) = count(be_i8, item_count).parse(data)?;
                Ok((rest, DbrValue::Char(values)))
            }
            DbrBasicType::Int => {
                let (rest, values) = count(be_i16, item_count).parse(data)?;
                Ok((rest, DbrValue::Int(values)))
            }
            DbrBasicType::Long => {
                let (rest, values) = count(be_i32, item_count).parse(data)?;
                Ok((rest, DbrValue::Long(values)))
            }
            DbrBasicType::Float => {
                let (rest, values) = count(be_f32, item_count).parse(data)?;
                Ok((rest, DbrValue::Float(values)))
            }
            DbrBasicType::Double => {
                let (rest, values) = count(be_f64, item_count).parse(data)?;
                Ok((rest, DbrValue::Double(values)))
            }
        }
    }
}

/// Implement a From<datatype> for a specific dbrvalue kind
macro_rules! impl_dbrvalue_conversions_between {
    ($variant:ident, $typ:ty) => {
        impl From<Vec<$typ>> for DbrValue {
            fn from(value: Vec<$typ>) -> Self {
                DbrValue::$variant(value)
            }
        }
        impl From<&$typ> for DbrValue {
            fn from(value: &$typ) -> Self {
                DbrValue::$variant(vec![value.clone()])
            }
        }
        impl TryFrom<&DbrValue> for Vec<$typ> {
            type Error = ErrorCondition;
            fn try_from(value: &DbrValue) -> Result<Self, Self::Error> {
                match value.convert_to(DbrBasicType::$variant)? {
                    DbrValue::$variant(v) => Ok(v),
                    _ => Err(ErrorCondition::NoConvert),
                }
            }
        }
    };
}
impl_dbrvalue_conversions_between!(Char, i8);
impl_dbrvalue_conversions_between!(Int, i16);
impl_dbrvalue_conversions_between!(Long, i32);
impl_dbrvalue_conversions_between!(Float, f32);
impl_dbrvalue_conversions_between!(Double, f64);
impl_dbrvalue_conversions_between!(Enum, u16);
impl_dbrvalue_conversions_between!(String, String);

macro_rules! impl_dbrvalue_copy_conversions_between {
    ($variant:ident, $typ:ty) => {
        impl From<$typ> for DbrValue {
            fn from(value: $typ) -> Self {
                DbrValue::$variant(vec![value])
            }
        }
        /// Takes the first element
        impl TryFrom<&DbrValue> for $typ {
            type Error = ErrorCondition;
            fn try_from(value: &DbrValue) -> Result<Self, Self::Error> {
                Vec::<$typ>::try_from(value)?
                    .into_iter()
                    .next()
                    .ok_or(ErrorCondition::BadCount)
            }
        }
    };
}
impl_dbrvalue_copy_conversions_between!(Char, i8);
impl_dbrvalue_copy_conversions_between!(Int, i16);
impl_dbrvalue_copy_conversions_between!(Long, i32);
impl_dbrvalue_copy_conversions_between!(Float, f32);
impl_dbrvalue_copy_conversions_between!(Double, f64);
impl_dbrvalue_copy_conversions_between!(Enum, u16);
impl_dbrvalue_copy_conversions_between!(String, String);

impl From<&str> for DbrValue {
    fn from(value: &str) -> Self {
        DbrValue::String(vec![value.to_string()])
    }
}

/// Lets a subscription or read ask for the untranslated value
impl From<&DbrValue> for DbrValue {
    fn from(value: &DbrValue) -> Self {
        value.clone()
    }
}

/// Display, alarm and warning limits, each as `(lower, upper)`
#[derive(Clone, Debug, PartialEq)]
pub struct Limits<T> {
    pub display_limits: (T, T),
    pub alarm_limits: (T, T),
    pub warning_limits: (T, T),
}
impl<T: Copy> Limits<T> {
    /// Build from the six values in the order they appear on the wire
    fn from_wire_order(values: &[T]) -> Self {
        Limits {
            display_limits: (values[1], values[0]),
            alarm_limits: (values[5], values[2]),
            warning_limits: (values[4], values[3]),
        }
    }
}
impl<T: ToBytes> Limits<T> {
    fn to_be_bytes(&self) -> Vec<u8> {
        let (d_l, d_u) = &self.display_limits;
        let (a_l, a_u) = &self.alarm_limits;
        let (w_l, w_u) = &self.warning_limits;

        [d_u, d_l, a_u, w_u, w_l, a_l]
            .iter()
            .flat_map(|v| v.to_be_bytes().as_ref().to_vec())
            .collect()
    }
}
impl<T: num::Bounded> Default for Limits<T> {
    fn default() -> Self {
        Self {
            display_limits: (T::min_value(), T::max_value()),
            alarm_limits: (T::min_value(), T::max_value()),
            warning_limits: (T::min_value(), T::max_value()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum DbrGraphics {
    String,
    Enum {
        strings: Vec<String>,
    },
    Char {
        units: String,
        limits: Limits<i8>,
    },
    Int {
        units: String,
        limits: Limits<i16>,
    },
    Long {
        units: String,
        limits: Limits<i32>,
    },
    Float {
        units: String,
        limits: Limits<f32>,
        precision: i16,
    },
    Double {
        units: String,
        limits: Limits<f64>,
        precision: i16,
    },
}

impl DbrGraphics {
    fn default_for(kind: DbrBasicType) -> Self {
        match kind {
            DbrBasicType::String => DbrGraphics::String,
            DbrBasicType::Enum => DbrGraphics::Enum {
                strings: Vec::new(),
            },
            DbrBasicType::Int => DbrGraphics::Int {
                units: String::new(),
                limits: Limits::default(),
            },
            DbrBasicType::Char => DbrGraphics::Char {
                units: String::new(),
                limits: Limits::default(),
            },
            DbrBasicType::Long => DbrGraphics::Long {
                units: String::new(),
                limits: Limits::default(),
            },
            DbrBasicType::Float => DbrGraphics::Float {
                units: String::new(),
                limits: Limits::default(),
                precision: 0,
            },
            DbrBasicType::Double => DbrGraphics::Double {
                units: String::new(),
                limits: Limits::default(),
                precision: 0,
            },
        }
    }

    pub fn units(&self) -> Option<&str> {
        match self {
            DbrGraphics::String | DbrGraphics::Enum { .. } => None,
            DbrGraphics::Char { units, .. }
            | DbrGraphics::Int { units, .. }
            | DbrGraphics::Long { units, .. }
            | DbrGraphics::Float { units, .. }
            | DbrGraphics::Double { units, .. } => Some(units),
        }
    }

    pub fn precision(&self) -> Option<i16> {
        match self {
            DbrGraphics::Float { precision, .. } | DbrGraphics::Double { precision, .. } => {
                Some(*precision)
            }
            _ => None,
        }
    }

    /// Write the graphics block, with control limits folded in where the
    /// protocol places them.
    fn write_be<W: io::Write>(&self, writer: &mut W, control: Option<&DbrControl>) -> io::Result<()> {
        fn units_bytes(units: &str) -> Vec<u8> {
            string_to_fixed_length_bytes(units, MAX_UNITS_SIZE)
        }
        let control = control.map(|c| c.to_be_bytes()).unwrap_or_default();
        match self {
            DbrGraphics::String => (),
            DbrGraphics::Enum { strings } => {
                let states = cmp::min(strings.len(), MAX_ENUM_STATES);
                writer.write_all(&(states as i16).to_be_bytes())?;
                for i in 0..MAX_ENUM_STATES {
                    let state = strings.get(i).map(String::as_str).unwrap_or("");
                    writer.write_all(&string_to_fixed_length_bytes(state, MAX_ENUM_STRING_SIZE))?;
                }
            }
            DbrGraphics::Char { units, limits } => {
                writer.write_all(&units_bytes(units))?;
                writer.write_all(&limits.to_be_bytes())?;
                writer.write_all(&control)?;
            }
            DbrGraphics::Int { units, limits } => {
                writer.write_all(&units_bytes(units))?;
                writer.write_all(&limits.to_be_bytes())?;
                writer.write_all(&control)?;
            }
            DbrGraphics::Long { units, limits } => {
                writer.write_all(&units_bytes(units))?;
                writer.write_all(&limits.to_be_bytes())?;
                writer.write_all(&control)?;
            }
            DbrGraphics::Float {
                units,
                limits,
                precision,
            } => {
                writer.write_all(&precision.to_be_bytes())?;
                writer.write_all(&[0u8; 2])?;
                writer.write_all(&units_bytes(units))?;
                writer.write_all(&limits.to_be_bytes())?;
                writer.write_all(&control)?;
            }
            DbrGraphics::Double {
                units,
                limits,
                precision,
            } => {
                writer.write_all(&precision.to_be_bytes())?;
                writer.write_all(&[0u8; 2])?;
                writer.write_all(&units_bytes(units))?;
                writer.write_all(&limits.to_be_bytes())?;
                writer.write_all(&control)?;
            }
        }
        Ok(())
    }
}

/// Control limits, as `(lower, upper)`
#[derive(Clone, Debug, PartialEq)]
pub enum DbrControl {
    Enum,
    String,
    Char(i8, i8),
    Int(i16, i16),
    Long(i32, i32),
    Float(f32, f32),
    Double(f64, f64),
}

impl DbrControl {
    fn default_for(kind: DbrBasicType) -> Self {
        match kind {
            DbrBasicType::String => DbrControl::String,
            DbrBasicType::Enum => DbrControl::Enum,
            DbrBasicType::Int => DbrControl::Int(i16::MIN, i16::MAX),
            DbrBasicType::Float => DbrControl::Float(f32::MIN, f32::MAX),
            DbrBasicType::Char => DbrControl::Char(i8::MIN, i8::MAX),
            DbrBasicType::Long => DbrControl::Long(i32::MIN, i32::MAX),
            DbrBasicType::Double => DbrControl::Double(f64::MIN, f64::MAX),
        }
    }
    /// Upper limit first, as on the wire
    fn to_be_bytes(&self) -> Vec<u8> {
        match self {
            DbrControl::Enum | DbrControl::String => Vec::new(),
            DbrControl::Char(l, u) => [u, l].iter().flat_map(|v| v.to_be_bytes()).collect(),
            DbrControl::Int(l, u) => [u, l].iter().flat_map(|v| v.to_be_bytes()).collect(),
            DbrControl::Long(l, u) => [u, l].iter().flat_map(|v| v.to_be_bytes()).collect(),
            DbrControl::Float(l, u) => [u, l].iter().flat_map(|v| v.to_be_bytes()).collect(),
            DbrControl::Double(l, u) => [u, l].iter().flat_map(|v| v.to_be_bytes()).collect(),
        }
    }
}

/// Parse the units and the six (or eight, with control) limits of a numeric type
fn units_and_limits<'a, T, P>(
    input: &'a [u8],
    parser: P,
    with_control: bool,
) -> IResult<&'a [u8], (String, Limits<T>, Option<(T, T)>)>
where
    T: Copy,
    P: Parser<&'a [u8], Output = T, Error = nom::error::Error<&'a [u8]>>,
{
    let (input, units) = take(MAX_UNITS_SIZE).parse(input)?;
    let (input, values) = count(parser, if with_control { 8 } else { 6 }).parse(input)?;
    let control = with_control.then(|| (values[7], values[6]));
    Ok((
        input,
        (
            fixed_length_bytes_to_string(units),
            Limits::from_wire_order(&values),
            control,
        ),
    ))
}

/// Parse the GR or CTRL metadata block for a basic type
fn graphics_block(
    basic_type: DbrBasicType,
    with_control: bool,
    input: &[u8],
) -> IResult<&[u8], (DbrGraphics, Option<DbrControl>)> {
    let control_or = |c: DbrControl| with_control.then_some(c);
    Ok(match basic_type {
        DbrBasicType::String => (input, (DbrGraphics::String, control_or(DbrControl::String))),
        DbrBasicType::Enum => {
            let (input, (no_str, states)) = (
                be_i16,
                count(take(MAX_ENUM_STRING_SIZE), MAX_ENUM_STATES),
            )
                .parse(input)?;
            let strings = states
                .into_iter()
                .take(no_str.clamp(0, MAX_ENUM_STATES as i16) as usize)
                .map(fixed_length_bytes_to_string)
                .collect();
            (
                input,
                (DbrGraphics::Enum { strings }, control_or(DbrControl::Enum)),
            )
        }
        DbrBasicType::Char => {
            let (input, (units, limits, control)) = units_and_limits(input, be_i8, with_control)?;
            (
                input,
                (
                    DbrGraphics::Char { units, limits },
                    control.map(|(l, u)| DbrControl::Char(l, u)),
                ),
            )
        }
        DbrBasicType::Int => {
            let (input, (units, limits, control)) = units_and_limits(input, be_i16, with_control)?;
            (
                input,
                (
                    DbrGraphics::Int { units, limits },
                    control.map(|(l, u)| DbrControl::Int(l, u)),
                ),
            )
        }
        DbrBasicType::Long => {
            let (input, (units, limits, control)) = units_and_limits(input, be_i32, with_control)?;
            (
                input,
                (
                    DbrGraphics::Long { units, limits },
                    control.map(|(l, u)| DbrControl::Long(l, u)),
                ),
            )
        }
        DbrBasicType::Float => {
            let (input, (precision, _pad)) = (be_i16, be_i16).parse(input)?;
            let (input, (units, limits, control)) = units_and_limits(input, be_f32, with_control)?;
            (
                input,
                (
                    DbrGraphics::Float {
                        units,
                        limits,
                        precision,
                    },
                    control.map(|(l, u)| DbrControl::Float(l, u)),
                ),
            )
        }
        DbrBasicType::Double => {
            let (input, (precision, _pad)) = (be_i16, be_i16).parse(input)?;
            let (input, (units, limits, control)) = units_and_limits(input, be_f64, with_control)?;
            (
                input,
                (
                    DbrGraphics::Double {
                        units,
                        limits,
                        precision,
                    },
                    control.map(|(l, u)| DbrControl::Double(l, u)),
                ),
            )
        }
    })
}

/// Basic DBR Data types, independent of category
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DbrBasicType {
    String = 0,
    Int = 1,
    Float = 2,
    Enum = 3,
    Char = 4,
    Long = 5,
    Double = 6,
}
impl TryFrom<u16> for DbrBasicType {
    type Error = ();
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            x if x == Self::String as u16 => Ok(Self::String),
            x if x == Self::Int as u16 => Ok(Self::Int),
            x if x == Self::Float as u16 => Ok(Self::Float),
            x if x == Self::Enum as u16 => Ok(Self::Enum),
            x if x == Self::Char as u16 => Ok(Self::Char),
            x if x == Self::Long as u16 => Ok(Self::Long),
            x if x == Self::Double as u16 => Ok(Self::Double),
            _ => Err(()),
        }
    }
}
impl DbrBasicType {
    /// Size of a single element on the wire
    pub fn element_size(&self) -> usize {
        match self {
            DbrBasicType::String => MAX_STRING_SIZE,
            DbrBasicType::Char => 1,
            DbrBasicType::Int | DbrBasicType::Enum => 2,
            DbrBasicType::Long | DbrBasicType::Float => 4,
            DbrBasicType::Double => 8,
        }
    }
}

/// Marks a type as being convertible to a DBRValue representation
pub trait IntoDbrBasicType {
    fn get_dbr_basic_type() -> DbrBasicType;
}

macro_rules! impl_into_dbr_basic_type {
    ($t:ty, $variant:ident) => {
        impl IntoDbrBasicType for $t {
            fn get_dbr_basic_type() -> DbrBasicType {
                DbrBasicType::$variant
            }
        }
    };
}

impl_into_dbr_basic_type!(i8, Char);
impl_into_dbr_basic_type!(i16, Int);
impl_into_dbr_basic_type!(u16, Enum);
impl_into_dbr_basic_type!(i32, Long);
impl_into_dbr_basic_type!(f32, Float);
impl_into_dbr_basic_type!(f64, Double);
impl_into_dbr_basic_type!(String, String);

/// Mapping of DBR categories
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DbrCategory {
    Basic = 0,
    Status = 1,
    Time = 2,
    Graphics = 3,
    Control = 4,
    /// The special single-valued DBR_CLASS_NAME
    ClassName = 8,
}
impl TryFrom<u16> for DbrCategory {
    type Error = ();
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            x if x == Self::Basic as u16 => Ok(Self::Basic),
            x if x == Self::Status as u16 => Ok(Self::Status),
            x if x == Self::Time as u16 => Ok(Self::Time),
            x if x == Self::Graphics as u16 => Ok(Self::Graphics),
            x if x == Self::Control as u16 => Ok(Self::Control),
            38 => Ok(Self::ClassName),
            _ => Err(()),
        }
    }
}

/// Represent and translate from ID every possible combination of `DBR_*_*`
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DbrType {
    pub basic_type: DbrBasicType,
    pub category: DbrCategory,
}

pub const DBR_BASIC_STRING: DbrType = DbrType {
    basic_type: DbrBasicType::String,
    category: DbrCategory::Basic,
};

pub const DBR_CLASS_NAME: DbrType = DbrType {
    basic_type: DbrBasicType::String,
    category: DbrCategory::ClassName,
};

impl TryFrom<u16> for DbrType {
    type Error = ();
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            38 => Ok(DBR_CLASS_NAME),
            value if value < 35 => Ok(Self {
                basic_type: (value % 7).try_into()?,
                category: (value / 7).try_into()?,
            }),
            _ => Err(()),
        }
    }
}

impl From<DbrType> for u16 {
    fn from(value: DbrType) -> Self {
        match value.category {
            DbrCategory::ClassName => 38,
            category => category as u16 * 7 + value.basic_type as u16,
        }
    }
}

impl DbrType {
    /// Give the lookup for the padding for each DBR type
    ///
    /// There is a datatype-specific padding inserted between the metadata
    /// about the value and the actual value itself. This is given as a
    /// lookup table rather than a calculation. The GR/CTRL float types pad
    /// after their precision instead, which is handled while parsing them.
    ///
    /// See <https://docs.epics-controls.org/en/latest/internal/ca_protocol.html#payload-data-types>
    pub fn get_metadata_padding(&self) -> usize {
        match (self.category, self.basic_type) {
            (DbrCategory::Status, DbrBasicType::Char) => 1,
            (DbrCategory::Status, DbrBasicType::Double) => 4,
            (DbrCategory::Time, DbrBasicType::Int) => 2,
            (DbrCategory::Time, DbrBasicType::Enum) => 2,
            (DbrCategory::Time, DbrBasicType::Char) => 3,
            (DbrCategory::Time, DbrBasicType::Double) => 4,
            (DbrCategory::Graphics, DbrBasicType::Char) => 1,
            (DbrCategory::Control, DbrBasicType::Char) => 1,
            _ => 0,
        }
    }
    pub fn new(basic_type: DbrBasicType, category: DbrCategory) -> Self {
        Self {
            basic_type,
            category,
        }
    }
}

impl FromStr for DbrType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_uppercase();
        let s = upper.strip_prefix("DBR_").unwrap_or(&upper);
        let (category, s) = match s.split_once('_') {
            Some((cats, rest)) => (
                match cats {
                    "BASIC" => DbrCategory::Basic,
                    "STS" => DbrCategory::Status,
                    "TIME" => DbrCategory::Time,
                    "GR" => DbrCategory::Graphics,
                    "CTRL" => DbrCategory::Control,
                    "CLASS" => DbrCategory::ClassName,
                    _ => return Err(()),
                },
                rest,
            ),
            None => (DbrCategory::Basic, s),
        };
        let kind = match s {
            "STRING" => DbrBasicType::String,
            "INT" => DbrBasicType::Int,
            "SHORT" => DbrBasicType::Int,
            "FLOAT" => DbrBasicType::Float,
            "ENUM" => DbrBasicType::Enum,
            "CHAR" => DbrBasicType::Char,
            "LONG" => DbrBasicType::Long,
            "DOUBLE" => DbrBasicType::Double,
            "NAME" if category == DbrCategory::ClassName => DbrBasicType::String,
            _ => return Err(()),
        };
        if matches!(category, DbrCategory::ClassName) && !matches!(kind, DbrBasicType::String) {
            // Class name is _only_ CLASS_NAME
            return Err(());
        }
        Ok(DbrType {
            basic_type: kind,
            category,
        })
    }
}

/// Represent alarm status of the record
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Status {
    pub status: i16,
    pub severity: i16,
}

/// Structured unit of exchange for records in the CA protocol
#[derive(Clone, Debug, PartialEq)]
pub enum Dbr {
    /// Value only, with no metadata
    Basic(DbrValue),
    /// Alarm status metadata alongside the record value
    Status { status: Status, value: DbrValue },
    /// Timestamp, alarm status, and value
    Time {
        status: Status,
        timestamp: SystemTime,
        value: DbrValue,
    },
    Graphics {
        status: Status,
        graphics: DbrGraphics,
        value: DbrValue,
    },
    Control {
        status: Status,
        graphics: DbrGraphics,
        control: DbrControl,
        value: DbrValue,
    },
    ClassName(DbrValue),
}

impl Dbr {
    pub fn take_value(self) -> DbrValue {
        match self {
            Dbr::Basic(value) => value,
            Dbr::Status { value, .. } => value,
            Dbr::Time { value, .. } => value,
            Dbr::Graphics { value, .. } => value,
            Dbr::Control { value, .. } => value,
            Dbr::ClassName(value) => value,
        }
    }
    /// Retrieve the [`DbrValue`] contained by this DBR
    pub fn value(&self) -> &DbrValue {
        match self {
            Dbr::Basic(value) => value,
            Dbr::Status { value, .. } => value,
            Dbr::Time { value, .. } => value,
            Dbr::Graphics { value, .. } => value,
            Dbr::Control { value, .. } => value,
            Dbr::ClassName(value) => value,
        }
    }
    /// If a DBR type encoding alarm status, fetch that
    pub fn status(&self) -> Option<Status> {
        match self {
            Dbr::Basic(_) => None,
            Dbr::Status { status, .. } => Some(*status),
            Dbr::Time { status, .. } => Some(*status),
            Dbr::Graphics { status, .. } => Some(*status),
            Dbr::Control { status, .. } => Some(*status),
            Dbr::ClassName(_) => None,
        }
    }
    pub fn timestamp(&self) -> Option<SystemTime> {
        match self {
            Dbr::Time { timestamp, .. } => Some(*timestamp),
            _ => None,
        }
    }
    pub fn graphics(&self) -> Option<&DbrGraphics> {
        match self {
            Dbr::Graphics { graphics, .. } | Dbr::Control { graphics, .. } => Some(graphics),
            _ => None,
        }
    }
    pub fn control(&self) -> Option<&DbrControl> {
        match self {
            Dbr::Control { control, .. } => Some(control),
            _ => None,
        }
    }
    pub fn data_type(&self) -> DbrType {
        let category = match self {
            Dbr::Basic(_) => DbrCategory::Basic,
            Dbr::Status { .. } => DbrCategory::Status,
            Dbr::Time { .. } => DbrCategory::Time,
            Dbr::Graphics { .. } => DbrCategory::Graphics,
            Dbr::Control { .. } => DbrCategory::Control,
            Dbr::ClassName(_) => return DBR_CLASS_NAME,
        };
        DbrType {
            basic_type: self.value().get_type(),
            category,
        }
    }

    /// Decode a DBR payload as received in a read or subscription reply.
    ///
    /// Nothing about the payload is trusted: a payload too short for the
    /// declared type and count is reported as malformed. Bytes past the
    /// declared count are the protocol's alignment padding and are ignored.
    pub fn from_bytes(data_type: DbrType, data_count: usize, data: &[u8]) -> Result<Dbr, MessageError> {
        Self::parse(data_type, data_count, data)
            .map(|(_, dbr)| dbr)
            .map_err(|_| malformed(data_type))
    }

    fn parse(data_type: DbrType, data_count: usize, data: &[u8]) -> IResult<&[u8], Dbr> {
        let category = data_type.category;
        let (data, status) = if matches!(category, DbrCategory::Basic | DbrCategory::ClassName) {
            (data, Status::default())
        } else {
            let (d, (status, severity)) = (be_i16, be_i16).parse(data)?;
            (d, Status { status, severity })
        };

        let (data, timestamp) = if category == DbrCategory::Time {
            let (input, (time_s, time_ns)) = (be_u32, be_u32).parse(data)?;
            (
                input,
                UNIX_EPOCH + Duration::new(time_s as u64 + EPICS_EPOCH_OFFSET, time_ns),
            )
        } else {
            (data, UNIX_EPOCH)
        };

        let (data, graphics) = match category {
            DbrCategory::Graphics => graphics_block(data_type.basic_type, false, data)?,
            DbrCategory::Control => graphics_block(data_type.basic_type, true, data)?,
            _ => (data, (DbrGraphics::String, None)),
        };

        // Offset the read buffer to account for metadata padding
        let (data, _) = take(data_type.get_metadata_padding()).parse(data)?;
        let (rest, value) = DbrValue::decode_value(data_type.basic_type, data_count, data)?;

        Ok((
            rest,
            match category {
                DbrCategory::Basic => Dbr::Basic(value),
                DbrCategory::Status => Dbr::Status { status, value },
                DbrCategory::Time => Dbr::Time {
                    status,
                    timestamp,
                    value,
                },
                DbrCategory::Graphics => Dbr::Graphics {
                    status,
                    graphics: graphics.0,
                    value,
                },
                DbrCategory::Control => Dbr::Control {
                    status,
                    graphics: graphics.0,
                    control: graphics
                        .1
                        .unwrap_or_else(|| DbrControl::default_for(data_type.basic_type)),
                    value,
                },
                DbrCategory::ClassName => Dbr::ClassName(value),
            },
        ))
    }

    pub fn to_bytes(&self, max_elems: Option<NonZeroUsize>) -> (usize, Vec<u8>) {
        let mut buffer = Cursor::new(Vec::new());
        // Writing to memory cannot fail
        let real_count = self.write_be(&mut buffer, max_elems).unwrap_or(0);
        (real_count, buffer.into_inner())
    }

    /// Write a requested number of elements to a stream
    ///
    /// Return the actual number of elements written
    pub fn write_be<W: io::Write>(
        &self,
        writer: &mut W,
        max_elems: Option<NonZeroUsize>,
    ) -> io::Result<usize> {
        let (real_elems, data) = self.value().to_bytes(max_elems);
        if let Some(status) = self.status() {
            writer.write_all(&status.status.to_be_bytes())?;
            writer.write_all(&status.severity.to_be_bytes())?;
        }
        match self {
            Dbr::Time { timestamp, .. } => {
                let unix_time = timestamp.duration_since(UNIX_EPOCH).unwrap_or_default();
                let time_s = unix_time.as_secs().saturating_sub(EPICS_EPOCH_OFFSET) as u32;
                writer.write_all(&time_s.to_be_bytes())?;
                writer.write_all(&unix_time.subsec_nanos().to_be_bytes())?;
            }
            Dbr::Graphics { graphics, .. } => graphics.write_be(writer, None)?,
            Dbr::Control {
                graphics, control, ..
            } => graphics.write_be(writer, Some(control))?,
            _ => (),
        }

        writer.write_all(&vec![0u8; self.data_type().get_metadata_padding()])?;
        writer.write_all(&data)?;
        Ok(real_elems)
    }

    /// Convert to a different DBR type, keeping whatever metadata survives
    pub fn convert_to(&self, dbr_type: DbrType) -> Result<Dbr, ErrorCondition> {
        let value = self.value().convert_to(dbr_type.basic_type)?;
        let same_type = dbr_type.basic_type == self.value().get_type();
        let status = self.status().unwrap_or_default();
        let graphics = match self.graphics() {
            Some(graphics) if same_type => graphics.clone(),
            _ => DbrGraphics::default_for(dbr_type.basic_type),
        };
        // ClassName cannot be converted as it isn't a normal form of data
        if matches!(self, Dbr::ClassName(_)) != (dbr_type.category == DbrCategory::ClassName) {
            return Err(ErrorCondition::NoConvert);
        }
        Ok(match dbr_type.category {
            DbrCategory::Basic => Dbr::Basic(value),
            DbrCategory::Status => Dbr::Status { status, value },
            DbrCategory::Time => Dbr::Time {
                status,
                timestamp: self.timestamp().unwrap_or_else(SystemTime::now),
                value,
            },
            DbrCategory::Graphics => Dbr::Graphics {
                status,
                graphics,
                value,
            },
            DbrCategory::Control => Dbr::Control {
                status,
                graphics,
                control: match self.control() {
                    Some(control) if same_type => control.clone(),
                    _ => DbrControl::default_for(dbr_type.basic_type),
                },
                value,
            },
            DbrCategory::ClassName => Dbr::ClassName(value),
        })
    }
}
