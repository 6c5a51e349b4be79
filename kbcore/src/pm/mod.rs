//! Power management state shared between process and interrupt context.
pub mod ca;
pub mod fixed;
pub mod policy;
pub mod random;

use crate::helpe::*;
use self::ca::PolicySlot;

/// Hardware core masks, as last observed, plus the overrides applied
/// on top of them. Read by the core-availability manager, never owned by it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreMasks {
    pub present:            CoreMask,
    pub ready:              CoreMask,
    pub transitioning:      CoreMask,
    pub debug_core_mask:    CoreMask,
    pub instr_enabled:      bool,
}

impl CoreMasks {
    /// Every core we are allowed to use at all.
    #[inline(always)]
    pub fn permissive(&self) -> CoreMask {
        self.present & self.debug_core_mask
    }
}

/// Everything guarded by the power-change spinlock.
#[derive(Debug)]
pub struct PowerChange {
    pub(crate) masks:                   CoreMasks,
    pub(crate) ca:                      PolicySlot,
    pub(crate) desired_shader_state:    CoreMask,
    // Set when a recomputation was requested while no policy was installed.
    pub(crate) update_deferred:         bool,
    pub(crate) core_state_updates:      u64,
}

impl PowerChange {
    pub fn masks(&self) -> &CoreMasks {
        &self.masks
    }

    /// Cores the driver currently wants powered.
    pub fn desired_shader_state(&self) -> CoreMask {
        self.desired_shader_state
    }

    pub fn update_deferred(&self) -> bool {
        self.update_deferred
    }

    pub fn core_state_updates(&self) -> u64 {
        self.core_state_updates
    }

    pub fn policy(&self) -> Option<&'static dyn CaPolicy> {
        self.ca.policy()
    }
}

pub struct PmDevice {
    /// Serializes policy swaps and other sleeping sequences.
    pub(crate) lock:    SleepLock<()>,
    power_change:       IrqSpinLock<PowerChange>,
    active_count:       AtomicU32,
}

impl PmDevice {
    pub fn new(present: CoreMask, debug_core_mask: CoreMask) -> Self {
        Self {
            lock:           SleepLock::new(()),
            power_change:   IrqSpinLock::new(PowerChange {
                masks: CoreMasks {
                    present,
                    debug_core_mask,
                    ..Default::default()
                },
                ca:                     PolicySlot::Inert,
                desired_shader_state:   0,
                update_deferred:        false,
                core_state_updates:     0,
            }),
            active_count:   AtomicU32::new(0),
        }
    }

    /// Takes the power-change spinlock.
    pub fn power_change(&self) -> IrqGuard<'_, PowerChange> {
        self.power_change.lock_irqsave()
    }

    /// Marks the device busy until the returned reference is dropped.
    pub fn context_active(&self) -> PmActiveRef<'_> {
        self.active_count.fetch_add(1, Ordering::SeqCst);

        PmActiveRef { pm: self }
    }

    pub fn active_count(&self) -> u32 {
        self.active_count.load(Ordering::SeqCst)
    }

    /// A suspend may only start when nothing holds the device active.
    pub fn can_suspend(&self) -> bool {
        self.active_count() == 0
    }
}

/// An active reference on the device; see [`PmDevice::context_active`].
#[must_use]
pub struct PmActiveRef<'a> {
    pm: &'a PmDevice,
}

impl Drop for PmActiveRef<'_> {
    fn drop(&mut self) {
        let prev = self.pm.active_count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "Unbalanced active reference!");
    }
}

/// Recomputes which shader cores should be powered. Caller holds the
/// power-change lock.
///
/// While a policy swap is under way the request is only recorded; the
/// swap replays it once the new policy is installed.
pub fn update_cores_state_nolock(pc: &mut PowerChange) {
    if let PolicySlot::Transitioning = pc.ca {
        if !pc.update_deferred {
            log::trace!("core state update deferred: policy change in progress");
        }
        pc.update_deferred = true;
        return;
    }

    pc.update_deferred = false;
    let desired = ca::get_core_mask_nolock(pc);
    if desired != pc.desired_shader_state {
        log::trace!("desired shader cores {:#x} -> {:#x}", pc.desired_shader_state, desired);
    }
    pc.desired_shader_state = desired;
    pc.core_state_updates += 1;
}

pub fn update_cores_state(dev: &Device) {
    update_cores_state_nolock(&mut dev.pm.power_change());
}

/// The hardware reports new ready/transitioning core masks. Caller holds
/// the power-change lock.
pub fn core_status_irq_nolock(pc: &mut PowerChange, ready: CoreMask, transitioning: CoreMask) {
    pc.masks.ready = ready;
    pc.masks.transitioning = transitioning;
    ca::update_core_status_nolock(pc, ready, transitioning);
    // The policy may have changed its mind.
    update_cores_state_nolock(pc);
}

/// Interrupt handler entry point for core power state changes.
pub fn core_status_irq(dev: &Device, ready: CoreMask, transitioning: CoreMask) {
    core_status_irq_nolock(&mut dev.pm.power_change(), ready, transitioning);
}

/// Pretends the hardware finished powering exactly the desired cores.
/// Returns the cores now ready.
pub fn settle_cores(dev: &Device) -> CoreMask {
    let mut pc = dev.pm.power_change();
    let desired = pc.desired_shader_state;
    core_status_irq_nolock(&mut pc, desired, 0);

    desired
}

/// Restricts the cores that may ever be powered. A mask selecting none of
/// the present cores is refused.
pub fn set_debug_core_mask(dev: &Device, mask: CoreMask) -> Result<(), PmError> {
    let mut pc = dev.pm.power_change();
    let present = pc.masks.present;
    if mask & present == 0 {
        return Err(PmError::InvalidCoreMask { mask, present });
    }
    pc.masks.debug_core_mask = mask;
    update_cores_state_nolock(&mut pc);
    drop(pc);
    log::debug!("debug core mask set to {:#x}", mask);

    Ok(())
}
