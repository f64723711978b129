use std::fmt;

use anyhow::{bail, Error};
use enumflags2::bitflags;
use serde::{Deserialize, Serialize};

/// Platform Configuration Registers relevant to disk sealing. Each PCR holds
/// a running hash of boot measurements; sealing policies predicate on a
/// subset of them.
#[bitflags]
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Pcr {
    /// PCR 0, firmware code.
    Pcr0 = 1 << 0,
    /// PCR 1, firmware configuration.
    Pcr1 = 1 << 1,
    /// PCR 2, option ROM code.
    Pcr2 = 1 << 2,
    /// PCR 3, option ROM configuration.
    Pcr3 = 1 << 3,
    /// PCR 4, boot manager code.
    Pcr4 = 1 << 4,
    /// PCR 5, boot manager configuration.
    Pcr5 = 1 << 5,
    /// PCR 7, secure boot policy.
    Pcr7 = 1 << 7,
    /// PCR 8, bootloader-measured commands.
    Pcr8 = 1 << 8,
    /// PCR 9, bootloader-measured files.
    Pcr9 = 1 << 9,
    /// PCR 11, unified kernel images.
    Pcr11 = 1 << 11,
    /// PCR 12, kernel command line, device identity and boot mode.
    Pcr12 = 1 << 12,
}

impl Pcr {
    /// Returns the register index of the PCR.
    pub fn index(&self) -> u32 {
        (*self as u32).trailing_zeros()
    }

    /// Returns the PCR for the given register index.
    pub fn from_index(index: u32) -> Result<Self, Error> {
        match index {
            0 => Ok(Pcr::Pcr0),
            1 => Ok(Pcr::Pcr1),
            2 => Ok(Pcr::Pcr2),
            3 => Ok(Pcr::Pcr3),
            4 => Ok(Pcr::Pcr4),
            5 => Ok(Pcr::Pcr5),
            7 => Ok(Pcr::Pcr7),
            8 => Ok(Pcr::Pcr8),
            9 => Ok(Pcr::Pcr9),
            11 => Ok(Pcr::Pcr11),
            12 => Ok(Pcr::Pcr12),
            _ => bail!("PCR index '{}' is not usable for disk sealing", index),
        }
    }
}

impl Serialize for Pcr {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u32(self.index())
    }
}

impl<'de> Deserialize<'de> for Pcr {
    fn deserialize<D>(deserializer: D) -> Result<Pcr, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let index = u32::deserialize(deserializer)?;
        Pcr::from_index(index).map_err(serde::de::Error::custom)
    }
}

/// A TPM non-volatile index handle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NvHandle(pub u32);

impl fmt::Display for NvHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// First handle of the contiguous 16-bit block of NV indices reserved for
/// PCR policy counters.
pub const PCR_POLICY_COUNTER_BLOCK_START: NvHandle = NvHandle(0x0188_0000);

/// Number of NV indices in the reserved policy-counter block.
pub const PCR_POLICY_COUNTER_BLOCK_LEN: u32 = 0x1_0000;

/// Well-known policy counter of run-mode sealed key objects under the
/// previous sealing scheme. Tracked so resealing can release it.
pub const LEGACY_RUN_POLICY_COUNTER: NvHandle = NvHandle(0x0188_0001);

/// Well-known policy counter of fallback sealed key objects under the
/// previous sealing scheme.
pub const LEGACY_FALLBACK_POLICY_COUNTER: NvHandle = NvHandle(0x0188_0002);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index() {
        assert_eq!(Pcr::Pcr0.index(), 0);
        assert_eq!(Pcr::Pcr4.index(), 4);
        assert_eq!(Pcr::Pcr7.index(), 7);
        assert_eq!(Pcr::Pcr12.index(), 12);
    }

    #[test]
    fn test_from_index() {
        assert_eq!(Pcr::from_index(7).unwrap(), Pcr::Pcr7);
        assert_eq!(Pcr::from_index(12).unwrap(), Pcr::Pcr12);
        assert_eq!(
            Pcr::from_index(6).unwrap_err().root_cause().to_string(),
            "PCR index '6' is not usable for disk sealing"
        );
    }

    #[test]
    fn test_serialize_roundtrip() {
        let serialized = serde_json::to_string(&Pcr::Pcr12).unwrap();
        assert_eq!(serialized, "12");
        let deserialized: Pcr = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized, Pcr::Pcr12);

        let pcrs: Vec<Pcr> = serde_json::from_str("[4, 7, 12]").unwrap();
        assert_eq!(pcrs, vec![Pcr::Pcr4, Pcr::Pcr7, Pcr::Pcr12]);
    }

    #[test]
    fn test_nv_handle_display() {
        assert_eq!(LEGACY_RUN_POLICY_COUNTER.to_string(), "0x01880001");
        assert_eq!(PCR_POLICY_COUNTER_BLOCK_START.to_string(), "0x01880000");
    }

    #[test]
    fn test_legacy_counters_inside_reserved_block() {
        let start = PCR_POLICY_COUNTER_BLOCK_START.0;
        let end = start + PCR_POLICY_COUNTER_BLOCK_LEN;
        assert!((start..end).contains(&LEGACY_RUN_POLICY_COUNTER.0));
        assert!((start..end).contains(&LEGACY_FALLBACK_POLICY_COUNTER.0));
    }
}
