//! Job scheduler state: the run-pool, scheduling contexts and atoms.
//!
//! Dispatch itself lives elsewhere; what is here is just enough scheduler
//! to drive [`ctx_attr`] the way the real one does, with the context
//! mutex always taken before the run-pool spinlock.
pub mod ctx_attr;

use std::ops::BitOr;

use crate::helpe::*;
use self::ctx_attr::{
    ctx_release_atom,
    ctx_retain_atom,
    runpool_release_ctx,
    runpool_retain_ctx,
    set_initial_attrs,
};

/// Flags a context is created with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CtxCreateFlags {
    /// The context will never submit work.
    pub submit_disabled:    bool,
    /// The client promises to submit compute work only.
    pub hint_only_compute:  bool,
}

/// Scheduling record of a context, guarded by its scheduling mutex.
#[derive(Debug)]
pub struct CtxSchedInfo {
    pub(crate) is_scheduled:    bool,
    pub(crate) flags:           CtxCreateFlags,
    pub(crate) attrs:           CtxAttrState,
    // Atoms holding a valid retained snapshot.
    pub(crate) nr_atoms:        u32,
}

impl CtxSchedInfo {
    pub fn new(flags: CtxCreateFlags) -> Self {
        Self {
            is_scheduled:   false,
            flags,
            attrs:          CtxAttrState::default(),
            nr_atoms:       0,
        }
    }

    #[inline(always)]
    pub fn is_scheduled(&self) -> bool {
        self.is_scheduled
    }

    pub fn flags(&self) -> CtxCreateFlags {
        self.flags
    }

    pub fn attrs(&self) -> &CtxAttrState {
        &self.attrs
    }

    pub fn nr_atoms(&self) -> u32 {
        self.nr_atoms
    }
}

/// One client's submission stream.
#[derive(Debug)]
pub struct Context {
    pub id: u32,
    jsctx:  SleepLock<CtxSchedInfo>,
}

impl Context {
    /// Takes the context's scheduling mutex.
    pub fn sched_info(&self) -> MutexGuard<'_, CtxSchedInfo> {
        self.jsctx.lock()
    }
}

/// Run-pool state shared with interrupt context.
#[derive(Debug, Default)]
pub struct RunpoolIrq {
    pub(crate) ctx_attr:        RunpoolAttrState,
    pub(crate) nr_running_ctxs: u32,
}

impl RunpoolIrq {
    pub fn ctx_attr(&self) -> &RunpoolAttrState {
        &self.ctx_attr
    }

    pub fn nr_running_ctxs(&self) -> u32 {
        self.nr_running_ctxs
    }
}

#[derive(Debug, Default)]
pub struct JsDevice {
    runpool_irq: IrqSpinLock<RunpoolIrq>,
}

impl JsDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the run-pool spinlock.
    pub fn runpool_irq(&self) -> IrqGuard<'_, RunpoolIrq> {
        self.runpool_irq.lock_irqsave()
    }
}

/// Requirements an atom places on the hardware.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreReq(pub u32);

impl CoreReq {
    pub const NONE:                     Self = Self(0);
    /// Fragment shading.
    pub const FS:                       Self = Self(1 << 0);
    /// Compute shading.
    pub const CS:                       Self = Self(1 << 1);
    /// Tiling.
    pub const T:                        Self = Self(1 << 2);
    /// Cache flush.
    pub const CF:                       Self = Self(1 << 3);
    /// Value writeback.
    pub const V:                        Self = Self(1 << 4);
    /// Must run on a single coherent core group.
    pub const COHERENT_GROUP:           Self = Self(1 << 6);
    /// Must run on one chosen coherent core group.
    pub const SPECIFIC_COHERENT_GROUP:  Self = Self(1 << 7);
    /// Not soft-stoppable.
    pub const NSS:                      Self = Self(1 << 9);
    pub const ONLY_COMPUTE:             Self = Self(1 << 10);

    #[inline(always)]
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for CoreReq {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A single unit of work.
#[derive(Debug, Default)]
pub struct Atom {
    pub core_req:   CoreReq,
    // Present while the atom is queued on a context.
    retained:       Option<AtomRetainedAttrs>,
}

impl Atom {
    pub fn new(core_req: CoreReq) -> Self {
        Self {
            core_req,
            retained: None,
        }
    }

    pub fn is_queued(&self) -> bool {
        self.retained.is_some()
    }
}

impl AtomAttrs for Atom {
    fn sched_attrs(&self) -> AttrSet {
        let req = self.core_req;
        let mut res = AttrSet::EMPTY;
        if req.intersects(CoreReq::NSS) {
            res.insert(Attribute::Nss);
        }
        let compute = req.intersects(CoreReq::CS | CoreReq::ONLY_COMPUTE);
        if compute {
            res.insert(Attribute::Compute);
            // Free to use any core group.
            if !req.intersects(CoreReq::COHERENT_GROUP | CoreReq::SPECIFIC_COHERENT_GROUP) {
                res.insert(Attribute::ComputeAllCores);
            }
        } else if !req.intersects(CoreReq::T) {
            res.insert(Attribute::NonCompute);
        }

        res
    }
}

impl Device {
    /// Creates a context and transfers its creation flags into attributes.
    pub fn create_context(&self, id: u32, flags: CtxCreateFlags) -> Context {
        let ctx = Context {
            id,
            jsctx: SleepLock::new(CtxSchedInfo::new(flags)),
        };
        set_initial_attrs(&mut ctx.jsctx.lock());

        ctx
    }

    /// Moves `ctx` into the run-pool.
    pub fn schedule_in(&self, ctx: &Context) {
        let mut info = ctx.jsctx.lock();
        assert!(!info.is_scheduled, "Context {} scheduled in twice!", ctx.id);
        let mut rp = self.js.runpool_irq();
        info.is_scheduled = true;
        runpool_retain_ctx(&mut rp.ctx_attr, &info);
        rp.nr_running_ctxs += 1;
        log::debug!("ctx {}: scheduled in ({} running)", ctx.id, rp.nr_running_ctxs);
    }

    /// Moves `ctx` out of the run-pool. A `true` result obliges the caller
    /// to retry job submission.
    pub fn schedule_out(&self, ctx: &Context) -> bool {
        let mut info = ctx.jsctx.lock();
        assert!(info.is_scheduled, "Context {} scheduled out while not scheduled!", ctx.id);
        let mut rp = self.js.runpool_irq();
        let changed = runpool_release_ctx(&mut rp.ctx_attr, &info);
        info.is_scheduled = false;
        rp.nr_running_ctxs -= 1;
        drop(rp);

        if changed {
            log::debug!("ctx {}: run-pool attributes relaxed on schedule-out", ctx.id);
        }
        changed
    }

    /// Queues `atom` on `ctx`, retaining its attributes.
    pub fn add_atom(&self, ctx: &Context, atom: &mut Atom) {
        assert!(!atom.is_queued(), "Atom added to context {} twice!", ctx.id);
        let mut info = ctx.jsctx.lock();
        // Only needed if scheduled, but taking it unconditionally is allowed.
        let mut rp = self.js.runpool_irq();
        let retained = ctx_retain_atom(&mut rp.ctx_attr, &mut info, &*atom);
        info.nr_atoms += 1;
        atom.retained = Some(retained);
    }

    /// Permanently removes `atom` from `ctx`. Releasing an atom that was
    /// never added is a no-op. A `true` result obliges the caller to retry
    /// job submission.
    pub fn remove_atom(&self, ctx: &Context, atom: &mut Atom) -> bool {
        let retained = atom.retained.take().unwrap_or_default();
        let mut info = ctx.jsctx.lock();
        let mut rp = self.js.runpool_irq();
        if retained.is_valid() {
            info.nr_atoms -= 1;
        }
        let changed = ctx_release_atom(&mut rp.ctx_attr, &mut info, retained);
        drop(rp);

        if changed {
            log::debug!("ctx {}: run-pool attributes relaxed on atom removal", ctx.id);
        }
        changed
    }

    pub fn runpool_attr_count(&self, attr: Attribute) -> RefCount {
        ctx_attr::count_on_runpool(&self.js.runpool_irq().ctx_attr, attr)
    }

    pub fn is_attr_on_runpool(&self, attr: Attribute) -> bool {
        ctx_attr::is_attr_on_runpool(&self.js.runpool_irq().ctx_attr, attr)
    }
}
