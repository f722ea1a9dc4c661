// SPDX-License-Identifier: MPL-2.0

use bitflags::bitflags;

bitflags! {
    /// `SMMU_CR0`. Every write must be confirmed through `SMMU_CR0ACK`.
    pub struct Control0: u32 {
        /// Non-secure SMMU enable.
        const SMMUEN =      1 << 0;
        /// Page request queue enable.
        const PRIQEN =      1 << 1;
        /// Event queue enable.
        const EVENTQEN =    1 << 2;
        /// Command queue processing enable.
        const CMDQEN =      1 << 3;
        /// ATS translated traffic is checked against the STE.
        const ATSCHK =      1 << 4;
    }
}

bitflags! {
    /// `SMMU_CR1`, the cacheability and shareability of table and queue
    /// accesses performed by the SMMU.
    pub struct Control1: u32 {
        const QUEUE_IC_WBC =    1 << 0;
        const QUEUE_OC_WBC =    1 << 2;
        const QUEUE_SH_IS =     3 << 4;
        const TABLE_IC_WBC =    1 << 6;
        const TABLE_OC_WBC =    1 << 8;
        const TABLE_SH_IS =     3 << 10;
    }
}

bitflags! {
    /// `SMMU_CR2`.
    pub struct Control2: u32 {
        /// EL2-E2H translation regime, for hypervisor-capable units.
        const E2H =         1 << 0;
        /// Record C_BAD_STREAMID for invalid input stream IDs.
        const RECINVSID =   1 << 1;
        /// Private TLB maintenance: broadcast TLB invalidations are ignored.
        const PTM =         1 << 2;
    }
}

bitflags! {
    /// `SMMU_IRQ_CTRL`. Every write must be confirmed through
    /// `SMMU_IRQ_CTRLACK`.
    pub struct IrqControl: u32 {
        const GERROR_IRQEN =    1 << 0;
        const PRIQ_IRQEN =      1 << 1;
        const EVENTQ_IRQEN =    1 << 2;
    }
}

bitflags! {
    /// `SMMU_GERROR`. An error is active while its bit differs from the
    /// same bit of `SMMU_GERRORN`.
    pub struct GlobalError: u32 {
        /// Command queue error, see `SMMU_CMDQ_CONS.ERR`.
        const CMDQ_ERR =            1 << 0;
        /// Event queue write aborted.
        const EVTQ_ABT_ERR =        1 << 2;
        /// Page request queue write aborted.
        const PRIQ_ABT_ERR =        1 << 3;
        /// CMD_SYNC MSI write aborted.
        const MSI_CMDQ_ABT_ERR =    1 << 4;
        /// Event queue MSI write aborted.
        const MSI_EVTQ_ABT_ERR =    1 << 5;
        /// Page request queue MSI write aborted.
        const MSI_PRIQ_ABT_ERR =    1 << 6;
        /// Global error MSI write aborted.
        const MSI_GERROR_ABT_ERR =  1 << 7;
        /// The SMMU entered service failure mode.
        const SFM_ERR =             1 << 8;
    }
}

impl GlobalError {
    /// Human-readable description of each error bit.
    pub const DESCRIPTIONS: [(GlobalError, &'static str); 8] = [
        (GlobalError::CMDQ_ERR, "command queue error"),
        (GlobalError::EVTQ_ABT_ERR, "event queue write aborted"),
        (GlobalError::PRIQ_ABT_ERR, "page request queue write aborted"),
        (GlobalError::MSI_CMDQ_ABT_ERR, "CMD_SYNC MSI write aborted"),
        (GlobalError::MSI_EVTQ_ABT_ERR, "event queue MSI write aborted"),
        (GlobalError::MSI_PRIQ_ABT_ERR, "page request queue MSI write aborted"),
        (GlobalError::MSI_GERROR_ABT_ERR, "global error MSI write aborted"),
        (GlobalError::SFM_ERR, "service failure mode"),
    ];
}
