// SPDX-License-Identifier: MPL-2.0

//! The translation core of the ARM System Memory Management Unit, version 3.
//!
//! An [`Smmu`] is attached by the platform glue with its register window,
//! the memory it may use for queues and tables, and the firmware's stream ID
//! mapping. The IOMMU framework then creates [`SmmuDomain`]s, binds devices
//! to them through [`SmmuContext`]s, and maps pages into them. Interrupt
//! handlers drain the event, global error and page request reports.
//!
//! The driver never sleeps: every wait on the hardware is a bounded spin, so
//! all entry points may be called with spin locks held.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

extern crate alloc;

pub mod cd;
pub mod command;
pub mod context;
pub mod dma;
pub mod domain;
pub mod error;
pub mod event;
pub mod options;
pub mod poll;
pub mod priq;
pub mod queue;
#[expect(unsafe_code)]
pub mod registers;
pub mod registry;
pub mod smmu;
pub mod strtab;

#[cfg(test)]
mod mock;

pub use self::{
    context::{
        IdentityStreamIdMap, IommuDevice, PciDeviceId, PciDeviceLocation, SmmuContext,
        StreamIdMap,
    },
    dma::{Daddr, DmaMemory, Paddr, Segment, PAGE_SIZE},
    domain::{IoPageTable, IoProt, SmmuDomain},
    error::{PageTableError, Result, SmmuError},
    event::EventQueueReport,
    options::SmmuOptions,
    registers::{GlobalError, MmioRegisters, RegisterWindow, SmmuFeatures},
    registry::SmmuRegistry,
    smmu::{Smmu, SmmuResources, UnitId},
};
