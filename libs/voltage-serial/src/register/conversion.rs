//! Raw value <-> text conversion
//!
//! `to_raw` turns a user supplied text value into the raw integer that goes on
//! the wire, `from_raw` renders a raw wire value as text. Both apply scale,
//! offset, rounding and word order inversion the same way, so a value written
//! and read back renders identically within the configured precision.

use super::bcd::{int_to_packed_bcd, packed_bcd_to_int};
use super::{RegisterConfig, RegisterFormat, WordOrder};
use crate::error::{Result, SerialError};

/// Reverse the order of 16-bit words for little endian registers
pub fn invert_word_order_if_needed(config: &RegisterConfig, value: u64) -> u64 {
    if config.word_order == WordOrder::BigEndian {
        return value;
    }

    let mut result = 0u64;
    let mut current = value;
    for _ in 0..config.word16_width() {
        result = (result << 16) | (current & 0xFFFF);
        current >>= 16;
    }
    result
}

/// Convert a text value into a raw register value
pub fn to_raw(config: &RegisterConfig, text: &str) -> Result<u64> {
    let format = config.format;
    let raw = match format {
        RegisterFormat::S8
        | RegisterFormat::S16
        | RegisterFormat::S24
        | RegisterFormat::S32
        | RegisterFormat::S64 => (parse_signed(config, text)? as u64) & format.value_mask(),
        RegisterFormat::Float => {
            let value = parse_double(config, text)? as f32;
            u64::from(value.to_bits())
        },
        RegisterFormat::Double => parse_double(config, text)?.to_bits(),
        RegisterFormat::Char8 => text.bytes().next().map(u64::from).unwrap_or(0),
        RegisterFormat::Bcd8
        | RegisterFormat::Bcd16
        | RegisterFormat::Bcd24
        | RegisterFormat::Bcd32 => int_to_packed_bcd(parse_unsigned(config, text)?, bcd_size(format)),
        _ => parse_unsigned(config, text)? & format.value_mask(),
    };
    Ok(invert_word_order_if_needed(config, raw))
}

/// Render a raw register value as text
pub fn from_raw(config: &RegisterConfig, raw: u64) -> String {
    let value = invert_word_order_if_needed(config, raw);
    match config.format {
        RegisterFormat::S8 => scaled_signed(config, i64::from(value as u8 as i8)),
        RegisterFormat::S16 => scaled_signed(config, i64::from(value as u16 as i16)),
        RegisterFormat::S24 => {
            let mut v = (value & 0xFF_FFFF) as u32;
            if v & 0x80_0000 != 0 {
                v |= 0xFF00_0000;
            }
            scaled_signed(config, i64::from(v as i32))
        },
        RegisterFormat::S32 => scaled_signed(config, i64::from(value as u32 as i32)),
        RegisterFormat::S64 => scaled_signed(config, value as i64),
        RegisterFormat::Bcd8
        | RegisterFormat::Bcd16
        | RegisterFormat::Bcd24
        | RegisterFormat::Bcd32 => {
            scaled_unsigned(config, packed_bcd_to_int(value, bcd_size(config.format)))
        },
        RegisterFormat::Float => {
            let v = f32::from_bits(value as u32);
            format_g(round_value(config.scale * f64::from(v) + config.offset, config.round_to), 7)
        },
        RegisterFormat::Double => {
            let v = f64::from_bits(value);
            format_g(round_value(config.scale * v + config.offset, config.round_to), 15)
        },
        RegisterFormat::Char8 => char::from((value & 0xFF) as u8).to_string(),
        _ => scaled_unsigned(config, value),
    }
}

fn bcd_size(format: RegisterFormat) -> u8 {
    match format {
        RegisterFormat::Bcd8 => 1,
        RegisterFormat::Bcd16 => 2,
        RegisterFormat::Bcd24 => 3,
        _ => 4,
    }
}

fn round_value(value: f64, round_to: f64) -> f64 {
    if round_to > 0.0 {
        (value / round_to).round() * round_to
    } else {
        value
    }
}

fn is_unscaled(config: &RegisterConfig) -> bool {
    config.scale == 1.0 && config.offset == 0.0
}

fn scaled_signed(config: &RegisterConfig, value: i64) -> String {
    if is_unscaled(config) && config.round_to == 0.0 {
        return value.to_string();
    }
    format_g(round_value(config.scale * value as f64 + config.offset, config.round_to), 15)
}

fn scaled_unsigned(config: &RegisterConfig, value: u64) -> String {
    if is_unscaled(config) && config.round_to == 0.0 {
        return value.to_string();
    }
    format_g(round_value(config.scale * value as f64 + config.offset, config.round_to), 15)
}

fn strip_hex_prefix(text: &str) -> Option<&str> {
    text.strip_prefix("0x").or_else(|| text.strip_prefix("0X"))
}

fn parse_double(config: &RegisterConfig, text: &str) -> Result<f64> {
    let value: f64 = text
        .trim()
        .parse()
        .map_err(|_| SerialError::conversion(format!("\"{text}\" can't be converted to number")))?;
    Ok((round_value(value, config.round_to) - config.offset) / config.scale)
}

fn parse_signed(config: &RegisterConfig, text: &str) -> Result<i64> {
    if text.is_empty() {
        return Err(SerialError::conversion("empty string can't be converted to number"));
    }
    let parsed = match strip_hex_prefix(text) {
        Some(hex) => Some(i64::from_str_radix(hex, 16).map_err(|_| {
            SerialError::conversion(format!("\"{text}\" can't be converted to integer"))
        })?),
        None => text.parse::<i64>().ok(),
    };
    match parsed {
        Some(value) if is_unscaled(config) => Ok(value),
        Some(value) => Ok(((value as f64 - config.offset) / config.scale).round() as i64),
        None => Ok(parse_double(config, text)?.round() as i64),
    }
}

fn parse_unsigned(config: &RegisterConfig, text: &str) -> Result<u64> {
    if text.is_empty() {
        return Err(SerialError::conversion("empty string can't be converted to number"));
    }
    let parsed = match strip_hex_prefix(text) {
        Some(hex) => Some(u64::from_str_radix(hex, 16).map_err(|_| {
            SerialError::conversion(format!("\"{text}\" can't be converted to unsigned integer"))
        })?),
        None => text.parse::<u64>().ok(),
    };
    let scaled = match parsed {
        Some(value) if is_unscaled(config) => return Ok(value),
        Some(value) => ((value as f64 - config.offset) / config.scale).round() as i64,
        None => parse_double(config, text)?.round() as i64,
    };
    if scaled < 0 {
        return Err(SerialError::conversion(format!(
            "\"{text}\" after applying scale and offset is not an unsigned integer: {scaled}"
        )));
    }
    Ok(scaled as u64)
}

/// printf-style `%.{precision}g` rendering
pub fn format_g(value: f64, precision: usize) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf".to_string() } else { "-inf".to_string() };
    }
    if value == 0.0 {
        return "0".to_string();
    }

    let precision = precision.max(1);
    let scientific = format!("{:.*e}", precision - 1, value);
    let (mantissa, exponent) = match scientific.split_once('e') {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => (scientific.as_str(), 0),
    };

    if exponent < -4 || exponent >= precision as i32 {
        let mantissa = trim_fraction(mantissa);
        let sign = if exponent < 0 { '-' } else { '+' };
        return format!("{mantissa}e{sign}{:02}", exponent.abs());
    }

    let decimals = (precision as i32 - 1 - exponent).max(0) as usize;
    trim_fraction(&format!("{value:.decimals$}")).to_string()
}

fn trim_fraction(text: &str) -> &str {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.')
    } else {
        text
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // unwrap() is acceptable in tests
mod tests {
    use super::*;
    use crate::register::{RegisterAddress, RegisterConfig, RegisterType};

    fn config(format: RegisterFormat) -> RegisterConfig {
        RegisterConfig::builder(RegisterType::Holding, RegisterAddress::Numeric(0))
            .format(format)
            .build()
            .unwrap()
    }

    #[test]
    fn test_format_g() {
        assert_eq!(format_g(1.5, 7), "1.5");
        assert_eq!(format_g(100.0, 15), "100");
        assert_eq!(format_g(0.1 + 0.2, 15), "0.3");
        assert_eq!(format_g(1234567.0, 7), "1234567");
        assert_eq!(format_g(12345678.0, 7), "1.234568e+07");
        assert_eq!(format_g(0.00001234, 7), "1.234e-05");
        assert_eq!(format_g(-2.25, 7), "-2.25");
    }

    #[test]
    fn test_unsigned_plain() {
        let cfg = config(RegisterFormat::U16);
        assert_eq!(to_raw(&cfg, "1234").unwrap(), 1234);
        assert_eq!(to_raw(&cfg, "0x1F").unwrap(), 0x1F);
        assert_eq!(to_raw(&cfg, "70000").unwrap(), 70000 & 0xFFFF);
        assert_eq!(from_raw(&cfg, 1234), "1234");
        assert!(to_raw(&cfg, "").is_err());
        assert!(to_raw(&cfg, "abc").is_err());
    }

    #[test]
    fn test_unsigned_negative_rejected() {
        let cfg = config(RegisterFormat::U16);
        let err = to_raw(&cfg, "-5").unwrap_err();
        assert!(matches!(err, SerialError::Conversion(_)));
    }

    #[test]
    fn test_signed() {
        let cfg = config(RegisterFormat::S16);
        assert_eq!(to_raw(&cfg, "-1").unwrap(), 0xFFFF);
        assert_eq!(from_raw(&cfg, 0xFFFF), "-1");
        assert_eq!(from_raw(&cfg, 0x8000), "-32768");

        let cfg = config(RegisterFormat::S24);
        assert_eq!(from_raw(&cfg, 0xFF_FFFE), "-2");
        assert_eq!(to_raw(&cfg, "-2").unwrap(), 0xFF_FFFE);
    }

    #[test]
    fn test_scale_and_offset() {
        let cfg = RegisterConfig::builder(RegisterType::Input, RegisterAddress::Numeric(0))
            .format(RegisterFormat::S16)
            .scale(0.1)
            .offset(-10.0)
            .build()
            .unwrap();
        assert_eq!(from_raw(&cfg, 250), "15");
        assert_eq!(to_raw(&cfg, "15").unwrap(), 250);
        assert_eq!(to_raw(&cfg, "15.04").unwrap(), 250);
    }

    #[test]
    fn test_round_to() {
        let cfg = RegisterConfig::builder(RegisterType::Input, RegisterAddress::Numeric(0))
            .format(RegisterFormat::U16)
            .scale(0.01)
            .round_to(0.1)
            .build()
            .unwrap();
        assert_eq!(from_raw(&cfg, 1234), "12.3");
    }

    #[test]
    fn test_float_round_trip() {
        let cfg = config(RegisterFormat::Float);
        let raw = to_raw(&cfg, "3.14").unwrap();
        assert_eq!(raw, u64::from(3.14f32.to_bits()));
        assert_eq!(from_raw(&cfg, raw), "3.14");

        let cfg = config(RegisterFormat::Double);
        let raw = to_raw(&cfg, "-273.15").unwrap();
        assert_eq!(from_raw(&cfg, raw), "-273.15");
    }

    #[test]
    fn test_bcd() {
        let cfg = config(RegisterFormat::Bcd16);
        assert_eq!(to_raw(&cfg, "1234").unwrap(), 0x1234);
        assert_eq!(from_raw(&cfg, 0x1234), "1234");

        let cfg = config(RegisterFormat::Bcd32);
        assert_eq!(from_raw(&cfg, 0x0012_3456), "123456");
    }

    #[test]
    fn test_char8() {
        let cfg = config(RegisterFormat::Char8);
        assert_eq!(to_raw(&cfg, "A").unwrap(), 0x41);
        assert_eq!(to_raw(&cfg, "").unwrap(), 0);
        assert_eq!(from_raw(&cfg, 0x41), "A");
    }

    #[test]
    fn test_word_order_inversion() {
        let cfg = RegisterConfig::builder(RegisterType::Holding, RegisterAddress::Numeric(0))
            .format(RegisterFormat::U32)
            .word_order(WordOrder::LittleEndian)
            .build()
            .unwrap();
        assert_eq!(to_raw(&cfg, "0x12345678").unwrap(), 0x5678_1234);
        assert_eq!(from_raw(&cfg, 0x5678_1234), (0x1234_5678u64).to_string());
    }

    #[test]
    fn test_round_trip_within_precision() {
        let cfg = RegisterConfig::builder(RegisterType::Holding, RegisterAddress::Numeric(0))
            .format(RegisterFormat::S32)
            .scale(0.5)
            .offset(3.0)
            .build()
            .unwrap();
        for text in ["-100", "0", "3", "7.5", "1000.5"] {
            let raw = to_raw(&cfg, text).unwrap();
            let back: f64 = from_raw(&cfg, raw).parse().unwrap();
            let expected: f64 = text.parse().unwrap();
            assert!((back - expected).abs() <= cfg.scale, "{text} -> {back}");
        }
    }
}
