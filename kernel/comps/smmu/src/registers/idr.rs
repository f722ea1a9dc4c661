// SPDX-License-Identifier: MPL-2.0

//! Feature discovery through the ID registers.

use bit_field::BitField;
use log::warn;

use super::{RegisterWindow, SMMU_IDR0, SMMU_IDR1, SMMU_IDR5};
use crate::{
    error::{Result, SmmuError},
    strtab::STRTAB_SPLIT,
};

/// Endianness of translation table walks supported by the unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TtEndian {
    Mixed,
    Little,
    Big,
}

/// How the unit reacts to faults on stallable transactions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StallModel {
    /// Stall and terminate are both supported.
    StallAndTerminate,
    /// Only terminate is supported.
    TerminateOnly,
    /// Stalling is forced.
    StallForced,
}

/// The features of an SMMU, decoded from `SMMU_IDR0`, `SMMU_IDR1` and
/// `SMMU_IDR5`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SmmuFeatures {
    /// The unit supports a two-level stream table.
    pub two_level_strtab: bool,
    /// The unit supports two-level context descriptor tables.
    pub two_level_cd: bool,
    pub tt_endian: TtEndian,
    pub stall_model: StallModel,
    /// Stage-1 and stage-2 translation support.
    pub stage1: bool,
    pub stage2: bool,
    /// Hypervisor stage-1 contexts (EL2 and EL2-E2H).
    pub hyp: bool,
    /// PCIe ATS.
    pub ats: bool,
    /// PCIe PRI and the page request queue.
    pub pri: bool,
    /// Message signalled interrupts.
    pub msi: bool,
    /// WFE wake-up events.
    pub sev: bool,
    /// Coherent access to tables and queues.
    pub coherent: bool,
    pub asid_bits: u32,
    pub vmid_bits: u32,
    pub sid_bits: u32,
    pub ssid_bits: u32,
    /// Maximum log2 sizes of the queues.
    pub cmdq_log2: u32,
    pub evtq_log2: u32,
    pub priq_log2: u32,
    /// Supported translation granules, as a bitmap of page sizes.
    pub granules: u64,
    /// Input (virtual) address size in bits.
    pub va_bits: u32,
    /// Output (physical) address size in bits.
    pub oas_bits: u32,
}

impl SmmuFeatures {
    /// Reads the ID registers of the unit.
    pub fn probe(regs: &dyn RegisterWindow) -> Result<Self> {
        Self::decode(
            regs.read32(SMMU_IDR0),
            regs.read32(SMMU_IDR1),
            regs.read32(SMMU_IDR5),
        )
    }

    /// Decodes the raw ID register values.
    pub fn decode(idr0: u32, idr1: u32, idr5: u32) -> Result<Self> {
        let tt_endian = match idr0.get_bits(21..23) {
            0b00 => TtEndian::Mixed,
            0b10 => TtEndian::Little,
            0b11 => TtEndian::Big,
            _ => return Err(SmmuError::Unsupported("unknown translation table endianness")),
        };

        // AArch64 table format is 0b10 (AArch64 only) or 0b11 (both).
        if !idr0.get_bit(3) {
            return Err(SmmuError::Unsupported("AArch64 table format"));
        }
        let stage1 = idr0.get_bit(1);
        if !stage1 {
            return Err(SmmuError::Unsupported("stage-1 translation"));
        }

        let stall_model = match idr0.get_bits(24..26) {
            0b00 => StallModel::StallAndTerminate,
            0b01 => StallModel::TerminateOnly,
            0b10 => StallModel::StallForced,
            _ => return Err(SmmuError::Unsupported("unknown stall model")),
        };

        if idr1.get_bit(30) || idr1.get_bit(29) {
            return Err(SmmuError::Unsupported(
                "embedded implementation with preset tables or queues",
            ));
        }

        let sid_bits = idr1.get_bits(0..6);
        let two_level_strtab = idr0.get_bits(27..29) == 0b01 && sid_bits > STRTAB_SPLIT;

        let mut granules = 0;
        if idr5.get_bit(4) {
            granules |= 1 << 12;
        }
        if idr5.get_bit(5) {
            granules |= 1 << 14;
        }
        if idr5.get_bit(6) {
            granules |= 1 << 16;
        }
        if granules & (1 << 12) == 0 {
            return Err(SmmuError::Unsupported("4 KiB translation granule"));
        }

        let va_bits = match idr5.get_bits(10..12) {
            0b00 => 48,
            0b01 => 52,
            _ => return Err(SmmuError::Unsupported("unknown virtual address size")),
        };

        let oas_bits = match idr5.get_bits(0..3) {
            0 => 32,
            1 => 36,
            2 => 40,
            3 => 42,
            4 => 44,
            5 => 48,
            6 => 52,
            other => {
                warn!("unknown output address size encoding {}, assuming 48 bits", other);
                48
            }
        };

        Ok(Self {
            two_level_strtab,
            two_level_cd: idr0.get_bit(19),
            tt_endian,
            stall_model,
            stage1,
            stage2: idr0.get_bit(0),
            hyp: idr0.get_bit(9),
            ats: idr0.get_bit(10),
            pri: idr0.get_bit(16),
            msi: idr0.get_bit(13),
            sev: idr0.get_bit(14),
            coherent: idr0.get_bit(4),
            asid_bits: if idr0.get_bit(12) { 16 } else { 8 },
            vmid_bits: if idr0.get_bit(18) { 16 } else { 8 },
            sid_bits,
            ssid_bits: idr1.get_bits(6..11),
            cmdq_log2: idr1.get_bits(21..26),
            evtq_log2: idr1.get_bits(16..21),
            priq_log2: idr1.get_bits(11..16),
            granules,
            va_bits,
            oas_bits,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // ST_LEVEL = 2-level, AArch64 tables, S1P, ASID16.
    const IDR0: u32 = (1 << 27) | (0b10 << 2) | (1 << 1) | (1 << 12);
    // SIDSIZE = 16, CMDQS = 19, EVENTQS = 19, PRIQS = 19.
    const IDR1: u32 = 16 | (19 << 21) | (19 << 16) | (19 << 11);
    // OAS = 48 bits, 4 KiB and 64 KiB granules.
    const IDR5: u32 = 5 | (1 << 4) | (1 << 6);

    #[test]
    fn decode_typical_unit() {
        let features = SmmuFeatures::decode(IDR0, IDR1, IDR5).unwrap();
        assert!(features.two_level_strtab);
        assert!(features.stage1);
        assert!(!features.stage2);
        assert!(!features.pri);
        assert_eq!(features.asid_bits, 16);
        assert_eq!(features.vmid_bits, 8);
        assert_eq!(features.sid_bits, 16);
        assert_eq!(features.cmdq_log2, 19);
        assert_eq!(features.granules, (1 << 12) | (1 << 16));
        assert_eq!(features.va_bits, 48);
        assert_eq!(features.oas_bits, 48);
        assert_eq!(features.tt_endian, TtEndian::Mixed);
    }

    #[test]
    fn small_sid_space_uses_linear_table() {
        let idr1 = (IDR1 & !0x3f) | STRTAB_SPLIT;
        let features = SmmuFeatures::decode(IDR0, idr1, IDR5).unwrap();
        assert!(!features.two_level_strtab);
    }

    #[test]
    fn aarch32_only_is_rejected() {
        let idr0 = (IDR0 & !(0b11 << 2)) | (0b01 << 2);
        assert_eq!(
            SmmuFeatures::decode(idr0, IDR1, IDR5),
            Err(SmmuError::Unsupported("AArch64 table format"))
        );
    }

    #[test]
    fn preset_tables_are_rejected() {
        let err = SmmuFeatures::decode(IDR0, IDR1 | (1 << 30), IDR5).unwrap_err();
        assert!(matches!(err, SmmuError::Unsupported(_)));
    }

    #[test]
    fn asid8_without_asid16() {
        let features = SmmuFeatures::decode(IDR0 & !(1 << 12), IDR1, IDR5).unwrap();
        assert_eq!(features.asid_bits, 8);
    }
}
