//! Context attribute tracking.
//!
//! Every scheduling [`Attribute`] is reference counted twice:
//!
//! - per context ([`CtxAttrState`]), once for the context's creation flags
//!   and once more for each queued atom that asserts it;
//! - run-pool wide ([`RunpoolAttrState`]), once for each *scheduled*
//!   context whose own count is non-zero.
//!
//! So `runpool[a]` always equals the number of scheduled contexts with
//! `ctx[a] > 0`. Only the zero/non-zero edge of the run-pool count means
//! anything to the scheduler, which is why releases report whether an
//! attribute switched off rather than handing out raw counts.
//!
//! Locking is expressed through the arguments: a `&mut CtxSchedInfo` comes
//! out of the context's scheduling mutex, a `&mut RunpoolAttrState` out of
//! the run-pool spinlock (see [`crate::Device::schedule_in`] and friends).
use crate::helpe::*;

/// Number of tracked attributes.
pub const ATTR_COUNT: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Attribute {
    /// Work that must not be soft-stopped.
    Nss,
    /// Compute-only work.
    Compute,
    /// Work needing none of the compute or tiler paths.
    NonCompute,
    /// Compute work that may spread over every core group.
    ComputeAllCores,
}

impl Attribute {
    pub const ALL: [Attribute; ATTR_COUNT] = [
        Attribute::Nss,
        Attribute::Compute,
        Attribute::NonCompute,
        Attribute::ComputeAllCores,
    ];

    #[inline(always)]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// A small set of attributes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttrSet(u8);

impl AttrSet {
    pub const EMPTY: Self = Self(0);

    #[inline(always)]
    pub fn insert(&mut self, attr: Attribute) {
        self.0 |= 1 << attr.index();
    }

    #[inline(always)]
    pub fn contains(self, attr: Attribute) -> bool {
        self.0 & (1 << attr.index()) != 0
    }

    #[inline(always)]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = Attribute> {
        Attribute::ALL
            .into_iter()
            .filter(move |a| self.contains(*a))
    }
}

impl FromIterator<Attribute> for AttrSet {
    fn from_iter<I: IntoIterator<Item = Attribute>>(iter: I) -> Self {
        let mut res = Self::EMPTY;
        for a in iter {
            res.insert(a);
        }

        res
    }
}

/// Per-context counts. Owned by the context, guarded by its scheduling mutex.
#[derive(Debug, Default, Clone)]
pub struct CtxAttrState {
    ref_count: [RefCount; ATTR_COUNT],
}

impl CtxAttrState {
    #[inline(always)]
    pub fn count(&self, attr: Attribute) -> RefCount {
        self.ref_count[attr.index()]
    }

    /// Returns the new count.
    fn retain(&mut self, attr: Attribute) -> RefCount {
        let slot = &mut self.ref_count[attr.index()];
        assert!(*slot < RefCount::MAX, "Context count for {:?} overflowed!", attr);
        *slot += 1;

        *slot
    }

    /// Returns the new count.
    fn release(&mut self, attr: Attribute) -> RefCount {
        let slot = &mut self.ref_count[attr.index()];
        if let Some(v) = slot.checked_sub(1) {
            *slot = v;
        } else {
            panic!("Context count for {:?} would go negative!", attr);
        }

        *slot
    }
}

/// Run-pool wide counts. Owned by the job scheduler, guarded by the
/// run-pool spinlock.
#[derive(Debug, Default, Clone)]
pub struct RunpoolAttrState {
    ref_count: [RefCount; ATTR_COUNT],
}

impl RunpoolAttrState {
    #[inline(always)]
    pub fn count(&self, attr: Attribute) -> RefCount {
        self.ref_count[attr.index()]
    }

    /// Returns `true` on the 0 -> 1 edge.
    fn retain(&mut self, attr: Attribute) -> bool {
        let slot = &mut self.ref_count[attr.index()];
        assert!(*slot < RefCount::MAX, "Run-pool count for {:?} overflowed!", attr);
        *slot += 1;
        if *slot == 1 {
            log::trace!("run-pool attribute {:?} on", attr);
            true
        } else { false }
    }

    /// Returns `true` on the 1 -> 0 edge.
    fn release(&mut self, attr: Attribute) -> bool {
        let slot = &mut self.ref_count[attr.index()];
        if let Some(v) = slot.checked_sub(1) {
            *slot = v;
        } else {
            panic!("Run-pool count for {:?} would go negative!", attr);
        }
        if *slot == 0 {
            log::trace!("run-pool attribute {:?} off", attr);
            true
        } else { false }
    }
}

/// Derives the attributes a unit of work asserts on its own, independently
/// of its context's creation flags. Implemented by [`Atom`]; other job kinds
/// may bring their own rules.
pub trait AtomAttrs {
    fn sched_attrs(&self) -> AttrSet;
}

/// What an atom retained when it was added to its context.
///
/// Move-only: [`ctx_release_atom`] consumes it, so an atom cannot be
/// released twice, and the release never looks at the atom itself again.
/// The default value is *invalid* and releases nothing.
#[derive(Debug, Default)]
pub struct AtomRetainedAttrs {
    attrs: Option<AttrSet>,
}

impl AtomRetainedAttrs {
    pub fn invalid() -> Self {
        Self { attrs: None }
    }

    #[inline(always)]
    pub fn is_valid(&self) -> bool {
        self.attrs.is_some()
    }

    /// Empty when invalid.
    pub fn attrs(&self) -> AttrSet {
        self.attrs.unwrap_or_default()
    }
}

/// Transfers the attributes implied by the context's creation flags into
/// its own counts. The run-pool is untouched: the context has not been
/// scheduled yet, and must not have been.
pub fn set_initial_attrs(ctx: &mut CtxSchedInfo) {
    assert!(!ctx.is_scheduled, "Initial attributes set on a scheduled context!");

    // A context that never submits has nothing worth tracking.
    if ctx.flags.submit_disabled {
        return;
    }
    if ctx.flags.hint_only_compute {
        ctx.attrs.retain(Attribute::Compute);
    }
    // Whether a context is non-compute depends on the atoms it runs; see
    // `ctx_retain_atom`.
}

/// Contributes the context's attributes to the run-pool. Called right after
/// the context has been marked scheduled.
///
/// No "changed" result here: scheduling a context in is itself followed by
/// an attempt to run more work.
pub fn runpool_retain_ctx(rp: &mut RunpoolAttrState, ctx: &CtxSchedInfo) {
    assert!(ctx.is_scheduled, "Retaining attributes of an unscheduled context!");

    for attr in Attribute::ALL {
        if is_attr_on_ctx(ctx, attr) {
            rp.retain(attr);
        }
    }
}

/// Withdraws the context's attributes from the run-pool. Called right
/// before the context is marked unscheduled.
///
/// Returns `true` if some attribute switched off run-pool wide. The
/// scheduler may then admit work it previously held back, and the caller
/// must retry submission.
pub fn runpool_release_ctx(rp: &mut RunpoolAttrState, ctx: &CtxSchedInfo) -> bool {
    assert!(ctx.is_scheduled, "Releasing attributes of an unscheduled context!");

    let mut changed = false;
    for attr in Attribute::ALL {
        if is_attr_on_ctx(ctx, attr) {
            changed |= rp.release(attr);
        }
    }

    changed
}

/// Retains the attributes `atom` asserts on behalf of `ctx`. If the context
/// is scheduled, any attribute this turns on for the context is also pushed
/// to the run-pool, within the same critical section.
///
/// The returned snapshot must travel with the atom until
/// [`ctx_release_atom`].
pub fn ctx_retain_atom<A>(
    rp:     &mut RunpoolAttrState,
    ctx:    &mut CtxSchedInfo,
    atom:   &A,
) -> AtomRetainedAttrs where A: AtomAttrs + ?Sized {
    let attrs = atom.sched_attrs();
    for attr in attrs.iter() {
        if ctx.attrs.retain(attr) == 1 && ctx.is_scheduled {
            rp.retain(attr);
        }
    }

    AtomRetainedAttrs { attrs: Some(attrs) }
}

/// Releases exactly what `retained` recorded. An invalid snapshot is a
/// no-op returning `false`.
///
/// Returns `true` under the same rule as [`runpool_release_ctx`].
pub fn ctx_release_atom(
    rp:         &mut RunpoolAttrState,
    ctx:        &mut CtxSchedInfo,
    retained:   AtomRetainedAttrs,
) -> bool {
    let Some(attrs) = retained.attrs else {
        return false;
    };

    let mut changed = false;
    for attr in attrs.iter() {
        // The last reference held by a scheduled context is also its
        // run-pool contribution.
        if ctx.is_scheduled && ctx.attrs.count(attr) == 1 {
            changed |= rp.release(attr);
        }
        ctx.attrs.release(attr);
    }

    changed
}

/// Caller holds the run-pool spinlock.
#[inline(always)]
pub fn count_on_runpool(rp: &RunpoolAttrState, attr: Attribute) -> RefCount {
    rp.count(attr)
}

/// Caller holds the run-pool spinlock.
#[inline(always)]
pub fn is_attr_on_runpool(rp: &RunpoolAttrState, attr: Attribute) -> bool {
    rp.count(attr) != 0
}

/// Caller holds the context's scheduling mutex.
#[inline(always)]
pub fn is_attr_on_ctx(ctx: &CtxSchedInfo, attr: Attribute) -> bool {
    ctx.attrs.count(attr) != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compute_ctx() -> CtxSchedInfo {
        let mut ctx = CtxSchedInfo::new(CtxCreateFlags {
            hint_only_compute: true,
            ..Default::default()
        });
        set_initial_attrs(&mut ctx);
        ctx
    }

    struct Asserts(AttrSet);

    impl AtomAttrs for Asserts {
        fn sched_attrs(&self) -> AttrSet {
            self.0
        }
    }

    fn nss_only() -> Asserts {
        Asserts([Attribute::Nss].into_iter().collect())
    }

    #[test]
    fn initial_attrs_follow_flags() {
        let ctx = compute_ctx();
        assert_eq!(ctx.attrs().count(Attribute::Compute), 1);
        assert!(is_attr_on_ctx(&ctx, Attribute::Compute));
        assert!(!is_attr_on_ctx(&ctx, Attribute::NonCompute));

        let mut quiet = CtxSchedInfo::new(CtxCreateFlags {
            submit_disabled:    true,
            hint_only_compute:  true,
        });
        set_initial_attrs(&mut quiet);
        assert!(Attribute::ALL.iter().all(|a| !is_attr_on_ctx(&quiet, *a)));
    }

    #[test]
    fn two_compute_contexts_in_and_out() {
        let mut rp = RunpoolAttrState::default();
        let mut a = compute_ctx();
        let mut b = compute_ctx();
        assert_eq!(count_on_runpool(&rp, Attribute::Compute), 0);

        a.is_scheduled = true;
        runpool_retain_ctx(&mut rp, &a);
        assert_eq!(count_on_runpool(&rp, Attribute::Compute), 1);
        assert!(is_attr_on_runpool(&rp, Attribute::Compute));

        b.is_scheduled = true;
        runpool_retain_ctx(&mut rp, &b);
        assert_eq!(count_on_runpool(&rp, Attribute::Compute), 2);

        assert!(!runpool_release_ctx(&mut rp, &a));
        a.is_scheduled = false;
        assert_eq!(count_on_runpool(&rp, Attribute::Compute), 1);

        assert!(runpool_release_ctx(&mut rp, &b));
        b.is_scheduled = false;
        assert_eq!(count_on_runpool(&rp, Attribute::Compute), 0);
        assert!(!is_attr_on_runpool(&rp, Attribute::Compute));
    }

    #[test]
    fn context_contributes_once_however_many_atoms() {
        let mut rp = RunpoolAttrState::default();
        let mut ctx = CtxSchedInfo::new(CtxCreateFlags::default());
        let first = ctx_retain_atom(&mut rp, &mut ctx, &nss_only());
        // Not scheduled: nothing reaches the run-pool.
        assert_eq!(count_on_runpool(&rp, Attribute::Nss), 0);

        ctx.is_scheduled = true;
        runpool_retain_ctx(&mut rp, &ctx);
        let second = ctx_retain_atom(&mut rp, &mut ctx, &nss_only());
        assert_eq!(ctx.attrs().count(Attribute::Nss), 2);
        assert_eq!(count_on_runpool(&rp, Attribute::Nss), 1);

        // Still held by `second`.
        assert!(!ctx_release_atom(&mut rp, &mut ctx, first));
        assert_eq!(count_on_runpool(&rp, Attribute::Nss), 1);
        // Last one out switches it off.
        assert!(ctx_release_atom(&mut rp, &mut ctx, second));
        assert_eq!(count_on_runpool(&rp, Attribute::Nss), 0);
        assert_eq!(ctx.attrs().count(Attribute::Nss), 0);

        assert!(!runpool_release_ctx(&mut rp, &ctx));
    }

    #[test]
    fn atom_release_while_unscheduled_leaves_runpool_alone() {
        let mut rp = RunpoolAttrState::default();
        let mut ctx = compute_ctx();
        let snap = ctx_retain_atom(&mut rp, &mut ctx, &nss_only());
        assert!(snap.is_valid());
        assert!(snap.attrs().contains(Attribute::Nss));
        assert!(!ctx_release_atom(&mut rp, &mut ctx, snap));
        assert_eq!(ctx.attrs().count(Attribute::Nss), 0);
        assert_eq!(ctx.attrs().count(Attribute::Compute), 1);
    }

    #[test]
    fn atom_and_flags_share_a_context_reference() {
        let mut rp = RunpoolAttrState::default();
        let mut ctx = compute_ctx();
        ctx.is_scheduled = true;
        runpool_retain_ctx(&mut rp, &ctx);
        let snap = ctx_retain_atom(&mut rp, &mut ctx, &Asserts(
            [Attribute::Compute].into_iter().collect()
        ));
        assert_eq!(count_on_runpool(&rp, Attribute::Compute), 1);
        // The flag reference still holds the attribute on.
        assert!(!ctx_release_atom(&mut rp, &mut ctx, snap));
        assert_eq!(count_on_runpool(&rp, Attribute::Compute), 1);
        assert!(runpool_release_ctx(&mut rp, &ctx));
    }

    #[test]
    fn invalid_snapshot_is_a_noop() {
        let mut rp = RunpoolAttrState::default();
        let mut ctx = compute_ctx();
        ctx.is_scheduled = true;
        runpool_retain_ctx(&mut rp, &ctx);
        assert!(!ctx_release_atom(&mut rp, &mut ctx, AtomRetainedAttrs::invalid()));
        assert!(!ctx_release_atom(&mut rp, &mut ctx, AtomRetainedAttrs::default()));
        assert_eq!(count_on_runpool(&rp, Attribute::Compute), 1);
        assert_eq!(ctx.attrs().count(Attribute::Compute), 1);
    }

    #[test]
    #[should_panic(expected = "unscheduled")]
    fn retain_requires_scheduled_context() {
        let mut rp = RunpoolAttrState::default();
        let ctx = compute_ctx();
        runpool_retain_ctx(&mut rp, &ctx);
    }

    #[test]
    #[should_panic(expected = "would go negative")]
    fn runpool_underflow_is_fatal() {
        let mut rp = RunpoolAttrState::default();
        let mut ctx = compute_ctx();
        ctx.is_scheduled = true;
        // Never retained.
        runpool_release_ctx(&mut rp, &ctx);
    }

    #[test]
    #[should_panic(expected = "scheduled context")]
    fn initial_attrs_before_scheduling_only() {
        let mut ctx = CtxSchedInfo::new(CtxCreateFlags::default());
        ctx.is_scheduled = true;
        set_initial_attrs(&mut ctx);
    }

    #[test]
    fn attr_set_basics() {
        let mut s = AttrSet::EMPTY;
        assert!(s.is_empty());
        s.insert(Attribute::ComputeAllCores);
        s.insert(Attribute::Nss);
        assert_eq!(s.iter().collect::<Vec<_>>(), vec![Attribute::Nss, Attribute::ComputeAllCores]);
        assert!(!s.contains(Attribute::Compute));
    }
}
