//! Channel identities for the KSTAR ECEI array.
//!
//! The imaging array is a 24 × 8 grid: 24 vertical positions, 8 horizontal
//! positions per view. A [`Channel`] is one element of that grid; a
//! [`ChannelRange`] is an inclusive rectangular block of it, iterated in
//! raster order with the horizontal index varying fastest. Ranges double as
//! names: `L0101-L2408` is both the label of the full array on the stream
//! and the index set a task expands over.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{DeltaError, Result};

/// Number of vertical positions in the array.
pub const NUM_V: usize = 24;
/// Number of horizontal positions per view.
pub const NUM_H: usize = 8;
/// Device tag of the low-field-side view.
pub const DEVICE_TAG: char = 'L';

static RANGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^L(\d{2})(\d{2})-L(\d{2})(\d{2})$").unwrap());

/// One channel of the imaging array, identified by its vertical and
/// horizontal grid position (both 1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Channel {
    v: usize,
    h: usize,
}

impl Channel {
    pub fn new(v: usize, h: usize) -> Result<Self> {
        if !(1..=NUM_V).contains(&v) || !(1..=NUM_H).contains(&h) {
            return Err(DeltaError::MalformedRange(format!(
                "channel position ({v}, {h}) outside the {NUM_V}x{NUM_H} array"
            )));
        }
        Ok(Self { v, h })
    }

    pub fn v(&self) -> usize {
        self.v
    }

    pub fn h(&self) -> usize {
        self.h
    }

    /// Linear index in raster order over the full array,
    /// `(v-1) * NUM_H + (h-1)`.
    pub fn idx(&self) -> usize {
        (self.v - 1) * NUM_H + (self.h - 1)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:02}{:02}", DEVICE_TAG, self.v, self.h)
    }
}

/// An inclusive rectangular block `[v0..v1] x [h0..h1]` of channels,
/// iterated horizontal-fastest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelRange {
    corner0: Channel,
    corner1: Channel,
}

impl ChannelRange {
    /// Builds the range spanned by two corner channels. The corners may be
    /// given in any order; the range is normalized to `v0 <= v1, h0 <= h1`.
    pub fn new(corner0: Channel, corner1: Channel) -> Self {
        let (v0, v1) = ordered(corner0.v, corner1.v);
        let (h0, h1) = ordered(corner0.h, corner1.h);
        Self {
            corner0: Channel { v: v0, h: h0 },
            corner1: Channel { v: v1, h: h1 },
        }
    }

    /// The full 24 × 8 array.
    pub fn full() -> Self {
        Self {
            corner0: Channel { v: 1, h: 1 },
            corner1: Channel { v: NUM_V, h: NUM_H },
        }
    }

    pub fn len(&self) -> usize {
        (self.corner1.v - self.corner0.v + 1) * (self.corner1.h - self.corner0.h + 1)
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, ch: &Channel) -> bool {
        (self.corner0.v..=self.corner1.v).contains(&ch.v)
            && (self.corner0.h..=self.corner1.h).contains(&ch.h)
    }

    /// Raster position of `ch` within this range, i.e. the row index a
    /// channel occupies in a chunk streamed for this range.
    pub fn position_of(&self, ch: &Channel) -> Option<usize> {
        if !self.contains(ch) {
            return None;
        }
        let width = self.corner1.h - self.corner0.h + 1;
        Some((ch.v - self.corner0.v) * width + (ch.h - self.corner0.h))
    }

    /// Channels in raster order, horizontal index varying fastest.
    pub fn iter(&self) -> impl Iterator<Item = Channel> + '_ {
        let (v0, v1) = (self.corner0.v, self.corner1.v);
        let (h0, h1) = (self.corner0.h, self.corner1.h);
        (v0..=v1).flat_map(move |v| (h0..=h1).map(move |h| Channel { v, h }))
    }
}

impl fmt::Display for ChannelRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.corner0, self.corner1)
    }
}

impl FromStr for ChannelRange {
    type Err = DeltaError;

    fn from_str(s: &str) -> Result<Self> {
        let caps = RANGE_RE
            .captures(s)
            .ok_or_else(|| DeltaError::MalformedRange(s.to_string()))?;
        // Two-digit captures always parse.
        let field = |i: usize| caps[i].parse::<usize>().unwrap_or(0);
        let corner0 = Channel::new(field(1), field(2))
            .map_err(|_| DeltaError::MalformedRange(s.to_string()))?;
        let corner1 = Channel::new(field(3), field(4))
            .map_err(|_| DeltaError::MalformedRange(s.to_string()))?;
        Ok(Self::new(corner0, corner1))
    }
}

impl Serialize for ChannelRange {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ChannelRange {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn ordered(a: usize, b: usize) -> (usize, usize) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_linear_index_is_raster_order() {
        assert_eq!(Channel::new(1, 1).unwrap().idx(), 0);
        assert_eq!(Channel::new(1, 8).unwrap().idx(), 7);
        assert_eq!(Channel::new(2, 1).unwrap().idx(), 8);
        assert_eq!(Channel::new(24, 8).unwrap().idx(), 191);
    }

    #[test]
    fn channel_positions_are_bounds_checked() {
        assert!(Channel::new(0, 1).is_err());
        assert!(Channel::new(25, 1).is_err());
        assert!(Channel::new(1, 9).is_err());
    }

    #[test]
    fn channel_stringifies_zero_padded() {
        assert_eq!(Channel::new(1, 1).unwrap().to_string(), "L0101");
        assert_eq!(Channel::new(24, 8).unwrap().to_string(), "L2408");
    }

    #[test]
    fn range_roundtrips_through_its_string_form() {
        for s in ["L0101-L2408", "L0304-L0506", "L0101-L0101"] {
            let range: ChannelRange = s.parse().unwrap();
            assert_eq!(range.to_string(), s);
        }
    }

    #[test]
    fn malformed_ranges_are_rejected() {
        for s in [
            "L0101-L2409", // h out of bounds
            "L2501-L2508", // v out of bounds
            "L0001-L0108", // zero position
            "L101-L2408",  // short field
            "L0101:L2408", // wrong separator
            "0101-2408",   // missing tag
            "L0101-L2408 ",
            "",
        ] {
            assert!(
                s.parse::<ChannelRange>().is_err(),
                "expected {s:?} to be rejected"
            );
        }
    }

    #[test]
    fn iteration_is_horizontal_fastest() {
        let range: ChannelRange = "L0201-L0302".parse().unwrap();
        let order: Vec<String> = range.iter().map(|c| c.to_string()).collect();
        assert_eq!(order, ["L0201", "L0202", "L0301", "L0302"]);
        assert_eq!(range.len(), 4);
    }

    #[test]
    fn full_array_has_192_channels() {
        let full = ChannelRange::full();
        assert_eq!(full.len(), 192);
        assert_eq!(full.to_string(), "L0101-L2408");
        // Within the full range the raster position equals the linear index.
        for ch in full.iter() {
            assert_eq!(full.position_of(&ch), Some(ch.idx()));
        }
    }

    #[test]
    fn position_within_subrange() {
        let range: ChannelRange = "L0503-L0604".parse().unwrap();
        let ch = Channel::new(6, 4).unwrap();
        assert_eq!(range.position_of(&ch), Some(3));
        assert_eq!(range.position_of(&Channel::new(1, 1).unwrap()), None);
    }
}
