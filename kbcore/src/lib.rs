//! Welcome to `kbcore`!
//!
//! Two pieces of a GPU kernel driver's scheduling core live here:
//!
//! 1. The *context attribute tracker* ([`js::ctx_attr`]), which reference
//!    counts scheduling properties of contexts and atoms and aggregates them
//!    over the contexts resident in the run-pool.
//! 2. The *core-availability policy manager* ([`pm::ca`]), which owns the
//!    pluggable policy deciding which shader cores may be powered, and swaps
//!    it without ever exposing a half-built policy to interrupt handlers.

pub mod config;
pub mod helpe;
pub mod js;
pub mod pm;
pub mod sync;

pub use crate::helpe::*;

/// The device handle. Everything in this crate takes one explicitly; there
/// is no ambient global state.
///
/// > ***LOCK ORDER:*** whenever both tiers are needed, the outer
/// > [`SleepLock`] (a context's scheduling mutex, or the power-management
/// > mutex) is taken *before* the inner [`IrqSpinLock`] (the run-pool lock,
/// > or the power-change lock). Interrupt-context code only ever takes the
/// > inner tier, so the reverse order would deadlock against it.
pub struct Device {
    pub config: DeviceConfig,
    /// Power management: the policy slot, hardware core masks and the
    /// locks protecting them.
    pub pm:     PmDevice,
    /// Job scheduler: run-pool wide attribute counts.
    pub js:     JsDevice,
}

impl Device {
    /// Builds a device from a validated [`DeviceConfig`]. The
    /// core-availability manager is *not* started; call [`pm::ca::init`].
    pub fn new(config: DeviceConfig) -> Result<Self, PmError> {
        config.validate()?;
        let pm = PmDevice::new(config.shader_present, config.debug_mask());

        Ok(Self {
            config,
            pm,
            js: JsDevice::new(),
        })
    }
}
