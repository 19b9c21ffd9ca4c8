use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleFormat {
    Float32,
    Int32,
    /// Packed 24-bit, three bytes per sample.
    Int24,
    Int16,
    Int8,
    UInt8,
}

impl SampleFormat {
    pub const ALL: [SampleFormat; 6] = [
        SampleFormat::Float32,
        SampleFormat::Int32,
        SampleFormat::Int24,
        SampleFormat::Int16,
        SampleFormat::Int8,
        SampleFormat::UInt8,
    ];

    pub const fn bytes(self) -> usize {
        match self {
            Self::Float32 | Self::Int32 => 4,
            Self::Int24 => 3,
            Self::Int16 => 2,
            Self::Int8 | Self::UInt8 => 1,
        }
    }

    pub const fn is_float(self) -> bool {
        matches!(self, Self::Float32)
    }

    pub const fn is_unsigned(self) -> bool {
        matches!(self, Self::UInt8)
    }

    /// Byte pattern of a silent sample.
    pub const fn silence_byte(self) -> u8 {
        match self {
            Self::UInt8 => 0x80,
            _ => 0,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Float32 => "float32",
            Self::Int32 => "int32",
            Self::Int24 => "int24",
            Self::Int16 => "int16",
            Self::Int8 => "int8",
            Self::UInt8 => "uint8",
        }
    }

    const fn bit(self) -> u8 {
        match self {
            Self::Float32 => 1 << 0,
            Self::Int32 => 1 << 1,
            Self::Int24 => 1 << 2,
            Self::Int16 => 1 << 3,
            Self::Int8 => 1 << 4,
            Self::UInt8 => 1 << 5,
        }
    }

    fn preference(self, candidate: SampleFormat) -> (u8, usize, u8, u8) {
        let wanted = self.bytes();
        let offered = candidate.bytes();
        let class = match offered.cmp(&wanted) {
            std::cmp::Ordering::Equal => 0,
            std::cmp::Ordering::Greater => 1,
            std::cmp::Ordering::Less => 2,
        };
        (
            class,
            wanted.abs_diff(offered),
            u8::from(!candidate.is_float()),
            u8::from(candidate.is_unsigned()),
        )
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Set of sample formats a device accepts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SampleFormatSet(u8);

impl SampleFormatSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        SampleFormat::ALL.into_iter().collect()
    }

    pub fn insert(&mut self, format: SampleFormat) {
        self.0 |= format.bit();
    }

    pub const fn contains(&self, format: SampleFormat) -> bool {
        self.0 & format.bit() != 0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = SampleFormat> + '_ {
        SampleFormat::ALL.into_iter().filter(|f| self.contains(*f))
    }

    /// Exact match first, then same width, then the nearest wider format,
    /// then the nearest narrower one. Float wins ties, then signed.
    pub fn closest(&self, requested: SampleFormat) -> Option<SampleFormat> {
        if self.contains(requested) {
            return Some(requested);
        }
        self.iter().min_by_key(|candidate| requested.preference(*candidate))
    }
}

impl FromIterator<SampleFormat> for SampleFormatSet {
    fn from_iter<I: IntoIterator<Item = SampleFormat>>(iter: I) -> Self {
        let mut set = Self::empty();
        for format in iter {
            set.insert(format);
        }
        set
    }
}

impl fmt::Display for SampleFormatSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        for (i, format) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            f.write_str(format.name())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::SampleFormat::*;
    use super::*;

    fn set(formats: &[SampleFormat]) -> SampleFormatSet {
        formats.iter().copied().collect()
    }

    #[test]
    fn exact_match_wins() {
        assert_eq!(set(&[Int16, Float32]).closest(Int16), Some(Int16));
    }

    #[test]
    fn same_width_before_wider() {
        assert_eq!(set(&[Int32, Int24]).closest(Float32), Some(Int32));
        assert_eq!(set(&[UInt8, Int16]).closest(Int8), Some(UInt8));
    }

    #[test]
    fn widening_prefers_nearest_then_float() {
        assert_eq!(set(&[Int32, Float32, Int24]).closest(Int16), Some(Int24));
        assert_eq!(set(&[Int32, Float32]).closest(Int16), Some(Float32));
        assert_eq!(set(&[Int32, Float32]).closest(Int24), Some(Float32));
    }

    #[test]
    fn narrowing_only_as_last_resort() {
        assert_eq!(set(&[Int8, UInt8]).closest(Int16), Some(Int8));
        assert_eq!(set(&[Int16, UInt8]).closest(Float32), Some(Int16));
    }

    #[test]
    fn empty_set_has_no_match() {
        assert_eq!(SampleFormatSet::empty().closest(Int16), None);
    }

    #[test]
    fn display_lists_names() {
        assert_eq!(set(&[Int16, Float32]).to_string(), "float32, int16");
        assert_eq!(SampleFormatSet::empty().to_string(), "none");
    }
}
