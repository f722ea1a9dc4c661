// SPDX-License-Identifier: MPL-2.0

//! Commands understood by the SMMU and their two-dword encoding.

mod queue;

use bit_field::BitField;
pub use queue::CommandQueue;

use crate::dma::Paddr;

/// Number of 64-bit words in a command queue entry.
pub const CMD_DWORDS: usize = 2;

/// `Range` value of `CMD_CFGI_STE_RANGE` that covers every stream.
pub const CFGI_RANGE_ALL: u8 = 31;

const OP_PREFETCH_CONFIG: u8 = 0x01;
const OP_CFGI_STE: u8 = 0x03;
const OP_CFGI_STE_RANGE: u8 = 0x04;
const OP_CFGI_CD: u8 = 0x05;
const OP_CFGI_CD_ALL: u8 = 0x06;
const OP_TLBI_NH_ALL: u8 = 0x10;
const OP_TLBI_NH_ASID: u8 = 0x11;
const OP_TLBI_NH_VA: u8 = 0x12;
const OP_TLBI_EL2_ALL: u8 = 0x20;
const OP_TLBI_NSNH_ALL: u8 = 0x30;
const OP_SYNC: u8 = 0x46;

const SYNC_CS_NONE: u64 = 0;
const SYNC_CS_IRQ: u64 = 1;
const SYNC_CS_SEV: u64 = 2;
/// Inner shareable.
const SYNC_MSH_IS: u64 = 3;
/// Inner and outer write-back cacheable.
const SYNC_MSIATTR_WB: u64 = 0xf;
const SYNC_MSI_ADDR_MASK: u64 = 0x000f_ffff_ffff_fffc;
const TLBI_ADDR_MASK: u64 = !0xfff;

/// How the SMMU signals the completion of a `CMD_SYNC`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncCompletion {
    /// No signal; completion is observed through `SMMU_CMDQ_CONS`.
    None,
    /// A 32-bit write of `data` to `addr`.
    Msi { addr: Paddr, data: u32 },
    /// A WFE wake-up event.
    Sev,
}

/// A command queue entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    /// Prefetches the configuration of a stream.
    PrefetchConfig { sid: u32 },
    /// Invalidates the cached STE of a stream.
    CfgiSte { sid: u32, leaf: bool },
    /// Invalidates the cached STEs of `2^(range + 1)` streams starting at
    /// `sid`; `range == CFGI_RANGE_ALL` covers every stream.
    CfgiSteRange { sid: u32, range: u8 },
    /// Invalidates the cached CD of a substream.
    CfgiCd { sid: u32, ssid: u32, leaf: bool },
    /// Invalidates every cached CD of a stream.
    CfgiCdAll { sid: u32 },
    /// Invalidates all non-hypervisor stage-1 TLB entries of a VMID.
    TlbiNhAll,
    /// Invalidates all TLB entries of an ASID.
    TlbiNhAsid { asid: u16 },
    /// Invalidates the TLB entries of one page of an ASID.
    TlbiNhVa { asid: u16, addr: u64, leaf: bool },
    /// Invalidates all EL2 TLB entries.
    TlbiEl2All,
    /// Invalidates all non-secure, non-hypervisor TLB entries.
    TlbiNsnhAll,
    /// Completes once every earlier command has been consumed.
    Sync { completion: SyncCompletion },
}

impl Command {
    pub fn opcode(&self) -> u8 {
        match self {
            Command::PrefetchConfig { .. } => OP_PREFETCH_CONFIG,
            Command::CfgiSte { .. } => OP_CFGI_STE,
            Command::CfgiSteRange { .. } => OP_CFGI_STE_RANGE,
            Command::CfgiCd { .. } => OP_CFGI_CD,
            Command::CfgiCdAll { .. } => OP_CFGI_CD_ALL,
            Command::TlbiNhAll => OP_TLBI_NH_ALL,
            Command::TlbiNhAsid { .. } => OP_TLBI_NH_ASID,
            Command::TlbiNhVa { .. } => OP_TLBI_NH_VA,
            Command::TlbiEl2All => OP_TLBI_EL2_ALL,
            Command::TlbiNsnhAll => OP_TLBI_NSNH_ALL,
            Command::Sync { .. } => OP_SYNC,
        }
    }

    /// The architectural name of the command.
    pub fn name(&self) -> &'static str {
        match self {
            Command::PrefetchConfig { .. } => "CMD_PREFETCH_CONFIG",
            Command::CfgiSte { .. } => "CMD_CFGI_STE",
            Command::CfgiSteRange { .. } => "CMD_CFGI_STE_RANGE",
            Command::CfgiCd { .. } => "CMD_CFGI_CD",
            Command::CfgiCdAll { .. } => "CMD_CFGI_CD_ALL",
            Command::TlbiNhAll => "CMD_TLBI_NH_ALL",
            Command::TlbiNhAsid { .. } => "CMD_TLBI_NH_ASID",
            Command::TlbiNhVa { .. } => "CMD_TLBI_NH_VA",
            Command::TlbiEl2All => "CMD_TLBI_EL2_ALL",
            Command::TlbiNsnhAll => "CMD_TLBI_NSNH_ALL",
            Command::Sync { .. } => "CMD_SYNC",
        }
    }

    /// Packs the command into its queue entry.
    pub fn encode(&self) -> [u64; CMD_DWORDS] {
        let mut dw0 = self.opcode() as u64;
        let mut dw1 = 0u64;

        match *self {
            Command::PrefetchConfig { sid } | Command::CfgiCdAll { sid } => {
                dw0.set_bits(32..64, sid as u64);
            }
            Command::CfgiSte { sid, leaf } => {
                dw0.set_bits(32..64, sid as u64);
                dw1.set_bit(0, leaf);
            }
            Command::CfgiSteRange { sid, range } => {
                dw0.set_bits(32..64, sid as u64);
                dw1.set_bits(0..5, range as u64);
            }
            Command::CfgiCd { sid, ssid, leaf } => {
                dw0.set_bits(12..32, ssid as u64);
                dw0.set_bits(32..64, sid as u64);
                dw1.set_bit(0, leaf);
            }
            Command::TlbiNhAsid { asid } => {
                dw0.set_bits(48..64, asid as u64);
            }
            Command::TlbiNhVa { asid, addr, leaf } => {
                dw0.set_bits(48..64, asid as u64);
                dw1 = addr & TLBI_ADDR_MASK;
                dw1.set_bit(0, leaf);
            }
            Command::TlbiNhAll | Command::TlbiEl2All | Command::TlbiNsnhAll => {}
            Command::Sync { completion } => match completion {
                SyncCompletion::None => {
                    dw0.set_bits(12..14, SYNC_CS_NONE);
                }
                SyncCompletion::Msi { addr, data } => {
                    dw0.set_bits(12..14, SYNC_CS_IRQ);
                    dw0.set_bits(22..24, SYNC_MSH_IS);
                    dw0.set_bits(24..28, SYNC_MSIATTR_WB);
                    dw0.set_bits(32..64, data as u64);
                    dw1 = addr as u64 & SYNC_MSI_ADDR_MASK;
                }
                SyncCompletion::Sev => {
                    dw0.set_bits(12..14, SYNC_CS_SEV);
                }
            },
        }

        [dw0, dw1]
    }

    /// Unpacks a queue entry, or returns `None` for an opcode the driver
    /// never issues.
    pub fn decode(entry: &[u64; CMD_DWORDS]) -> Option<Self> {
        let [dw0, dw1] = *entry;
        let sid = dw0.get_bits(32..64) as u32;
        let asid = dw0.get_bits(48..64) as u16;
        let leaf = dw1.get_bit(0);

        let cmd = match dw0.get_bits(0..8) as u8 {
            OP_PREFETCH_CONFIG => Command::PrefetchConfig { sid },
            OP_CFGI_STE => Command::CfgiSte { sid, leaf },
            OP_CFGI_STE_RANGE => Command::CfgiSteRange {
                sid,
                range: dw1.get_bits(0..5) as u8,
            },
            OP_CFGI_CD => Command::CfgiCd {
                sid,
                ssid: dw0.get_bits(12..32) as u32,
                leaf,
            },
            OP_CFGI_CD_ALL => Command::CfgiCdAll { sid },
            OP_TLBI_NH_ALL => Command::TlbiNhAll,
            OP_TLBI_NH_ASID => Command::TlbiNhAsid { asid },
            OP_TLBI_NH_VA => Command::TlbiNhVa {
                asid,
                addr: dw1 & TLBI_ADDR_MASK,
                leaf,
            },
            OP_TLBI_EL2_ALL => Command::TlbiEl2All,
            OP_TLBI_NSNH_ALL => Command::TlbiNsnhAll,
            OP_SYNC => {
                let completion = match dw0.get_bits(12..14) {
                    SYNC_CS_NONE => SyncCompletion::None,
                    SYNC_CS_IRQ => SyncCompletion::Msi {
                        addr: (dw1 & SYNC_MSI_ADDR_MASK) as Paddr,
                        data: dw0.get_bits(32..64) as u32,
                    },
                    SYNC_CS_SEV => SyncCompletion::Sev,
                    _ => return None,
                };
                Command::Sync { completion }
            }
            _ => return None,
        };
        Some(cmd)
    }
}
