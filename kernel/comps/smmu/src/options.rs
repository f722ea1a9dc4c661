// SPDX-License-Identifier: MPL-2.0

/// Options for attaching an SMMU.
///
/// The defaults suit every unit the driver has been used with; the knobs
/// exist for memory-constrained platforms and for tests.
///
/// ```ignore
/// let options = SmmuOptions::new().max_cmdq_log2(6).sync_timeout(1000);
/// ```
#[derive(Clone, Debug)]
pub struct SmmuOptions {
    pub(crate) max_cmdq_log2: u32,
    pub(crate) max_evtq_log2: u32,
    pub(crate) max_priq_log2: u32,
    pub(crate) sync_timeout: usize,
    pub(crate) ack_timeout: usize,
    pub(crate) force_linear_stream_table: bool,
    pub(crate) l1_size_shift: u32,
}

impl SmmuOptions {
    /// Creates new options with the default values.
    pub fn new() -> Self {
        Self {
            max_cmdq_log2: 8,
            max_evtq_log2: 7,
            max_priq_log2: 7,
            sync_timeout: 10_000,
            ack_timeout: 100_000,
            force_linear_stream_table: false,
            l1_size_shift: 20,
        }
    }

    /// Sets the upper bound of the command queue size, in log2 entries.
    pub fn max_cmdq_log2(mut self, log2: u32) -> Self {
        self.max_cmdq_log2 = log2;
        self
    }

    /// Sets the upper bound of the event queue size, in log2 entries.
    pub fn max_evtq_log2(mut self, log2: u32) -> Self {
        self.max_evtq_log2 = log2;
        self
    }

    /// Sets the upper bound of the page request queue size, in log2 entries.
    pub fn max_priq_log2(mut self, log2: u32) -> Self {
        self.max_priq_log2 = log2;
        self
    }

    /// Sets how many times `CMD_SYNC` completion is polled before giving up.
    pub fn sync_timeout(mut self, iterations: usize) -> Self {
        self.sync_timeout = iterations;
        self
    }

    /// Sets how many times an acknowledge register is polled before giving up.
    pub fn ack_timeout(mut self, iterations: usize) -> Self {
        self.ack_timeout = iterations;
        self
    }

    /// Uses a linear stream table even if the unit supports two levels.
    pub fn force_linear_stream_table(mut self, force: bool) -> Self {
        self.force_linear_stream_table = force;
        self
    }

    /// Sets the size budget of the level-1 stream table, in log2 bytes.
    pub fn l1_size_shift(mut self, shift: u32) -> Self {
        self.l1_size_shift = shift;
        self
    }
}

impl Default for SmmuOptions {
    fn default() -> Self {
        Self::new()
    }
}
