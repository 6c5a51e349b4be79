//! Core availability: which shader cores the driver may power.
//!
//! Exactly one [`CaPolicy`] is active per device. Swapping it is the
//! delicate part: `init`/`term` may sleep, so they cannot run under the
//! power-change lock, yet interrupt handlers read the slot under that lock
//! at any time. The slot is therefore emptied (see [`PolicySlot`]) for the
//! duration of the swap, and readers fall back to "every allowed core"
//! until the new policy is fully built.
use crate::helpe::*;
use super::{
    policy::{find_policy, POLICIES},
    update_cores_state_nolock,
};

/// The active-policy slot.
///
/// `Inert -> Active(P)` on [`init`], `Active(P) -> Transitioning ->
/// Active(P')` on [`set_policy`], `Active(P) -> Inert` on [`term`].
#[derive(Debug)]
pub enum PolicySlot {
    Inert,
    Active {
        policy: &'static dyn CaPolicy,
        data:   PolicyData,
    },
    /// A swap is in progress; there is no policy to ask.
    Transitioning,
}

impl PolicySlot {
    pub fn policy(&self) -> Option<&'static dyn CaPolicy> {
        match self {
            PolicySlot::Active { policy, .. } => Some(*policy),
            _ => None,
        }
    }
}

/// Installs the configured policy, or the first registry entry.
pub fn init(dev: &Device) -> Result<(), PmError> {
    might_sleep();
    let policy = match dev.config.ca_policy {
        Some(ref name) => find_policy(name)?,
        None => POLICIES[0],
    };

    let _pm = dev.pm.lock.lock();
    assert!(
        matches!(dev.pm.power_change().ca, PolicySlot::Inert),
        "Core availability initialized twice!"
    );
    // Nothing is marked active unless this succeeds.
    let data = policy.init(dev)?;

    let mut pc = dev.pm.power_change();
    pc.ca = PolicySlot::Active { policy, data };
    update_cores_state_nolock(&mut pc);
    drop(pc);
    log::debug!("core availability policy `{}` active", policy.name());

    Ok(())
}

/// Retires the active policy, leaving the manager inert.
pub fn term(dev: &Device) {
    might_sleep();
    let _pm = dev.pm.lock.lock();
    let old = {
        let mut pc = dev.pm.power_change();
        let old = std::mem::replace(&mut pc.ca, PolicySlot::Inert);
        // Inert answers permissively; don't leave the old policy's choice behind.
        update_cores_state_nolock(&mut pc);
        old
    };
    match old {
        PolicySlot::Active { policy, data } => {
            policy.term(dev, data);
            log::debug!("core availability policy `{}` terminated", policy.name());
        },
        other => panic!("Core availability terminated without a prior init! ({:?})", other),
    }
}

/// The built-in policies, in registry order.
pub fn list_policies() -> &'static [&'static dyn CaPolicy] {
    POLICIES
}

pub fn policy_count() -> usize {
    POLICIES.len()
}

/// `None` while uninitialized or mid-swap.
pub fn get_policy(dev: &Device) -> Option<&'static dyn CaPolicy> {
    dev.pm.power_change().ca.policy()
}

/// Replaces the active policy with `new_policy`.
///
/// Interrupt-context readers see the old policy, then no policy, then the
/// new one, each fully initialized. If `new_policy` fails to initialize,
/// the previous policy (or failing that, the default one) is brought back
/// and the failure is returned.
pub fn set_policy(dev: &Device, new_policy: &'static dyn CaPolicy) -> Result<(), PmError> {
    might_sleep();
    log::debug!("core availability policy change to `{}`", new_policy.name());

    // We're in a syscall, so a suspend cannot be racing us yet; holding
    // the device active keeps it that way until we're done.
    let _active = dev.pm.context_active();
    let _pm = dev.pm.lock.lock();

    // Take the policy away from IRQ handlers.
    let old = {
        let mut pc = dev.pm.power_change();
        assert!(
            !matches!(pc.ca, PolicySlot::Inert),
            "Core availability policy set before init!"
        );
        std::mem::replace(&mut pc.ca, PolicySlot::Transitioning)
    };

    let old_policy = match old {
        PolicySlot::Active { policy, data } => {
            policy.term(dev, data);
            Some(policy)
        },
        // An earlier swap could not bring anything back.
        _ => None,
    };

    let (installed, res) = match new_policy.init(dev) {
        Ok(data) => (Some((new_policy, data)), Ok(())),
        Err(e) => {
            log::warn!("{}", e);
            (reinstate(dev, old_policy), Err(e))
        },
    };

    let mut pc = dev.pm.power_change();
    if let Some((policy, data)) = installed {
        pc.ca = PolicySlot::Active { policy, data };
    }
    // Core power changes attempted while the slot was empty were only
    // recorded; make them now.
    update_cores_state_nolock(&mut pc);
    let CoreMasks { ready, transitioning, .. } = pc.masks;
    update_core_status_nolock(&mut pc, ready, transitioning);

    res
}

/// Brings back `old`, else the default policy. Returns `None` only if
/// neither initializes, in which case the slot stays empty.
fn reinstate(
    dev: &Device,
    old: Option<&'static dyn CaPolicy>,
) -> Option<(&'static dyn CaPolicy, PolicyData)> {
    old.into_iter()
        .chain(std::iter::once(POLICIES[0]))
        .find_map(|p| match p.init(dev) {
            Ok(data) => {
                log::warn!("core availability policy `{}` reinstated", p.name());
                Some((p, data))
            },
            Err(e) => {
                log::warn!("{}", e);
                None
            },
        })
}

/// Looks a registry policy up by name and makes it active.
pub fn set_policy_by_name(dev: &Device, name: &str) -> Result<(), PmError> {
    let policy = find_policy(name.trim())?;
    set_policy(dev, policy)
}

/// Names every registry policy, the active one in brackets:
/// `"[fixed] random"`.
pub fn format_policies(dev: &Device) -> String {
    let current = get_policy(dev).map(|p| p.name());
    POLICIES
        .iter()
        .map(|p| {
            if Some(p.name()) == current {
                format!("[{}]", p.name())
            } else {
                String::from(p.name())
            }
        })
        .join(" ")
}

/// Caller holds the power-change lock.
///
/// Always a subset of `present & debug_core_mask`.
pub fn get_core_mask_nolock(pc: &PowerChange) -> CoreMask {
    let permissive = pc.masks.permissive();
    // Instrumentation needs every core.
    if pc.masks.instr_enabled {
        return permissive;
    }
    match &pc.ca {
        PolicySlot::Active { policy, data } => policy.get_core_mask(data, &pc.masks) & permissive,
        // Mid-swap: never hold scheduling back for lack of a policy.
        _ => permissive,
    }
}

pub fn get_core_mask(dev: &Device) -> CoreMask {
    get_core_mask_nolock(&dev.pm.power_change())
}

/// Caller holds the power-change lock. A no-op while no policy is active.
pub fn update_core_status_nolock(pc: &mut PowerChange, ready: CoreMask, transitioning: CoreMask) {
    let masks = pc.masks;
    if let PolicySlot::Active { policy, data } = &mut pc.ca {
        policy.update_core_status(data, &masks, ready, transitioning);
    }
}

pub fn update_core_status(dev: &Device, ready: CoreMask, transitioning: CoreMask) {
    update_core_status_nolock(&mut dev.pm.power_change(), ready, transitioning);
}

pub fn instr_enable(dev: &Device) {
    let mut pc = dev.pm.power_change();
    pc.masks.instr_enabled = true;
    update_cores_state_nolock(&mut pc);
}

pub fn instr_disable(dev: &Device) {
    let mut pc = dev.pm.power_change();
    pc.masks.instr_enabled = false;
    update_cores_state_nolock(&mut pc);
}
