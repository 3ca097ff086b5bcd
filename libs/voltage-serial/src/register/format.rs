//! Register value formats and word order

use serde::{Deserialize, Serialize};
use std::fmt;

/// Value encoding of a register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RegisterFormat {
    #[default]
    U16,
    S16,
    U8,
    S8,
    U24,
    S24,
    U32,
    S32,
    U64,
    S64,
    Bcd8,
    Bcd16,
    Bcd24,
    Bcd32,
    Float,
    Double,
    Char8,
}

impl RegisterFormat {
    /// Number of bytes the format occupies on the wire
    pub fn byte_width(self) -> u8 {
        match self {
            RegisterFormat::S64 | RegisterFormat::U64 | RegisterFormat::Double => 8,
            RegisterFormat::U32
            | RegisterFormat::S32
            | RegisterFormat::Bcd32
            | RegisterFormat::Float => 4,
            RegisterFormat::U24 | RegisterFormat::S24 | RegisterFormat::Bcd24 => 3,
            RegisterFormat::Char8 => 1,
            _ => 2,
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            RegisterFormat::S8
                | RegisterFormat::S16
                | RegisterFormat::S24
                | RegisterFormat::S32
                | RegisterFormat::S64
        )
    }

    pub fn is_bcd(self) -> bool {
        matches!(
            self,
            RegisterFormat::Bcd8 | RegisterFormat::Bcd16 | RegisterFormat::Bcd24 | RegisterFormat::Bcd32
        )
    }

    pub fn is_floating(self) -> bool {
        matches!(self, RegisterFormat::Float | RegisterFormat::Double)
    }

    /// Mask applied to integer raw values of this format
    pub fn value_mask(self) -> u64 {
        match self {
            RegisterFormat::U8 | RegisterFormat::S8 | RegisterFormat::Bcd8 | RegisterFormat::Char8 => {
                0xFF
            },
            RegisterFormat::U16 | RegisterFormat::S16 | RegisterFormat::Bcd16 => 0xFFFF,
            RegisterFormat::U24 | RegisterFormat::S24 | RegisterFormat::Bcd24 => 0xFF_FFFF,
            RegisterFormat::U32 | RegisterFormat::S32 | RegisterFormat::Bcd32 => 0xFFFF_FFFF,
            RegisterFormat::Float => 0xFFFF_FFFF,
            RegisterFormat::U64 | RegisterFormat::S64 | RegisterFormat::Double => u64::MAX,
        }
    }
}

impl fmt::Display for RegisterFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegisterFormat::U8 => "u8",
            RegisterFormat::S8 => "s8",
            RegisterFormat::U16 => "u16",
            RegisterFormat::S16 => "s16",
            RegisterFormat::U24 => "u24",
            RegisterFormat::S24 => "s24",
            RegisterFormat::U32 => "u32",
            RegisterFormat::S32 => "s32",
            RegisterFormat::U64 => "u64",
            RegisterFormat::S64 => "s64",
            RegisterFormat::Bcd8 => "bcd8",
            RegisterFormat::Bcd16 => "bcd16",
            RegisterFormat::Bcd24 => "bcd24",
            RegisterFormat::Bcd32 => "bcd32",
            RegisterFormat::Float => "float",
            RegisterFormat::Double => "double",
            RegisterFormat::Char8 => "char8",
        };
        f.write_str(name)
    }
}

/// Order of 16-bit words inside a multi-word value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WordOrder {
    #[default]
    BigEndian,
    LittleEndian,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_width() {
        assert_eq!(RegisterFormat::U16.byte_width(), 2);
        assert_eq!(RegisterFormat::U8.byte_width(), 2);
        assert_eq!(RegisterFormat::Bcd8.byte_width(), 2);
        assert_eq!(RegisterFormat::Char8.byte_width(), 1);
        assert_eq!(RegisterFormat::S24.byte_width(), 3);
        assert_eq!(RegisterFormat::Float.byte_width(), 4);
        assert_eq!(RegisterFormat::Double.byte_width(), 8);
    }

    #[test]
    fn test_serde_names() {
        #[derive(Deserialize)]
        struct Holder {
            format: RegisterFormat,
            word_order: WordOrder,
        }

        let holder: Holder = figment::Figment::new()
            .merge(figment::providers::Serialized::defaults(
                [("format", "bcd16"), ("word_order", "little_endian")]
                    .into_iter()
                    .collect::<std::collections::BTreeMap<_, _>>(),
            ))
            .extract()
            .unwrap();
        assert_eq!(holder.format, RegisterFormat::Bcd16);
        assert_eq!(holder.word_order, WordOrder::LittleEndian);
    }
}
