//! The core-availability policy interface and the registry of policies.
use crate::helpe::*;
use super::{
    fixed::FIXED,
    random::RandomData,
};
#[cfg(not(feature = "customer-release"))]
use super::random::RANDOM;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyId {
    Fixed   = 1,
    Random  = 2,
}

/// Decides which shader cores may be powered.
///
/// A policy object itself is immutable and shared: whatever state it needs
/// per device is handed out by [`init`](CaPolicy::init) as [`PolicyData`],
/// kept in the device's policy slot, and returned to
/// [`term`](CaPolicy::term).
///
/// `init` and `term` may sleep and are never called under the power-change
/// lock. `get_core_mask` and `update_core_status` are *always* called under
/// it, possibly from interrupt context, and must be short and non-blocking.
pub trait CaPolicy: fmt::Debug + Sync {
    fn name(&self) -> &'static str;

    fn id(&self) -> PolicyId;

    fn init(&self, dev: &Device) -> Result<PolicyData, PmError>;

    fn term(&self, dev: &Device, data: PolicyData);

    /// Must return a subset of `masks.present`.
    fn get_core_mask(&self, data: &PolicyData, masks: &CoreMasks) -> CoreMask;

    /// The hardware's view of the cores. Masks need not match anything the
    /// policy reported before.
    fn update_core_status(
        &self,
        data:           &mut PolicyData,
        masks:          &CoreMasks,
        ready:          CoreMask,
        transitioning:  CoreMask,
    );
}

/// Per-device state of the active policy.
#[derive(Debug)]
pub enum PolicyData {
    Fixed,
    Random(RandomData),
}

/// Every policy the driver ships with. The first entry is the default.
pub static POLICIES: &[&dyn CaPolicy] = &[
    &FIXED,
    #[cfg(not(feature = "customer-release"))]
    &RANDOM,
];

pub fn find_policy(name: &str) -> Result<&'static dyn CaPolicy, PmError> {
    POLICIES
        .iter()
        .copied()
        .find(|p| p.name() == name)
        .ok_or_else(|| PmError::UnknownPolicy(String::from(name)))
}
