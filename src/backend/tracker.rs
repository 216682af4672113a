// Record-time resource state tracking
//
// Every buffer has one tracked entry, every texture one entry per
// subresource (index = mip_slice + array_slice * mip_levels). An entry holds
// the last recorded state, the owning queue family and an optional pending
// ownership transfer, all as atomics so recording never takes a lock.
//
// Resolution runs in two phases: plan every affected subresource first, then
// commit. A rejected barrier leaves tracking untouched.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use super::state::{
    BufferBarrier, BufferStateFlags, OwnershipTransfer, ResourceBarrierFlags, SubresourceSelector,
    TextureBarrier, TextureStateFlags,
};
use crate::error::{RhiError, RhiResult};
use crate::format::Format;

// =============================================================================
// PER-SUBRESOURCE ENTRIES
// =============================================================================

/// Owner value of a subresource no queue has touched yet.
const NO_OWNER: u32 = u32::MAX;

// Pending transfers pack into one u64 so they can be swapped atomically:
// bit 63 marks a valid entry, bits 48..56 and 40..48 hold the source and
// destination families, the low 32 bits the state the release left.
const PENDING_VALID: u64 = 1 << 63;

/// Release recorded on one family and not yet acquired on the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingTransfer {
    src_family: u32,
    dst_family: u32,
    before: u32,
}

impl PendingTransfer {
    fn encode(self) -> u64 {
        PENDING_VALID
            | ((self.src_family as u64 & 0xff) << 48)
            | ((self.dst_family as u64 & 0xff) << 40)
            | self.before as u64
    }

    fn decode(bits: u64) -> Option<Self> {
        if bits & PENDING_VALID == 0 {
            return None;
        }
        Some(Self {
            src_family: ((bits >> 48) & 0xff) as u32,
            dst_family: ((bits >> 40) & 0xff) as u32,
            before: bits as u32,
        })
    }
}

#[derive(Debug)]
struct SubresourceState {
    // Portable state bits of the last recorded barrier (0 = undefined/common)
    state: AtomicU32,
    // Queue family that last used the subresource, or NO_OWNER
    owner: AtomicU32,
    // Encoded PendingTransfer, 0 when nothing is in flight
    pending: AtomicU64,
}

/// Tracked state of every subresource of one resource.
#[derive(Debug)]
pub(crate) struct StateTracker {
    subresources: Box<[SubresourceState]>,
}

impl StateTracker {
    pub fn new(count: usize, initial: u32) -> Self {
        let subresources = (0..count)
            .map(|_| SubresourceState {
                state: AtomicU32::new(initial),
                owner: AtomicU32::new(NO_OWNER),
                pending: AtomicU64::new(0),
            })
            .collect();
        Self { subresources }
    }

    pub fn len(&self) -> usize {
        self.subresources.len()
    }

    pub fn state(&self, index: usize) -> Option<u32> {
        self.subresources
            .get(index)
            .map(|s| s.state.load(Ordering::Acquire))
    }

    pub fn owner(&self, index: usize) -> Option<u32> {
        self.subresources
            .get(index)
            .map(|s| s.owner.load(Ordering::Acquire))
            .filter(|&owner| owner != NO_OWNER)
    }

    /// Forgets state and ownership, e.g. when a swap chain recreates its images.
    pub fn reset(&self, initial: u32) {
        for s in self.subresources.iter() {
            s.state.store(initial, Ordering::Release);
            s.owner.store(NO_OWNER, Ordering::Release);
            s.pending.store(0, Ordering::Release);
        }
    }

    fn plan(
        &self,
        index: usize,
        request: &Request,
        ctx: &ResolveContext<'_>,
    ) -> RhiResult<Step> {
        let entry = &self.subresources[index];
        let tracked = entry.state.load(Ordering::Acquire);
        let owner = entry.owner.load(Ordering::Acquire);
        let pending_bits = entry.pending.load(Ordering::Acquire);
        let pending = PendingTransfer::decode(pending_bits);

        // Step 1: an acquire only completes a release that is still pending.
        // The states must mirror the release, otherwise the two queues would
        // disagree about the layout the data is in.
        if let Some(QueueTransfer::Acquire { src_family, dst_family }) = request.transfer {
            let release = pending
                .filter(|p| p.src_family == src_family && p.dst_family == dst_family)
                .ok_or_else(|| {
                    RhiError::bad_arguments(format!(
                        "{}: acquire from queue family {} has no matching release",
                        request.name, src_family
                    ))
                })?;
            if request.after != tracked {
                return Err(RhiError::bad_arguments(format!(
                    "{}: acquire state {:#x} does not mirror the released state {:#x}",
                    request.name, request.after, tracked
                )));
            }
            return Ok(Step {
                before: release.before,
                state: request.after,
                owner: dst_family,
                pending: 0,
            });
        }

        // Step 2: using a resource that was released to this family without
        // acquiring it first would skip the acquire half of the transfer.
        if let Some(p) = pending {
            if p.dst_family == ctx.family {
                return Err(RhiError::bad_arguments(format!(
                    "{}: released by queue family {} but not acquired",
                    request.name, p.src_family
                )));
            }
        }

        // Step 3: implicit ownership change. Vulkan needs an explicit transfer
        // unless the old contents are thrown away; D3D12 and Metal just move it.
        let owned_elsewhere = owner != NO_OWNER && owner != ctx.family;
        let mut pending_out = pending_bits;
        if owned_elsewhere {
            if ctx.explicit_ownership && !request.flags.contains(ResourceBarrierFlags::DISCARD_CONTENT) {
                return Err(RhiError::bad_arguments(format!(
                    "{}: owned by queue family {}, used on family {} without an ownership transfer",
                    request.name, owner, ctx.family
                )));
            }
            log::debug!(
                "{}: ownership moves from queue family {} to {}",
                request.name,
                owner,
                ctx.family
            );
            pending_out = 0;
        }

        // Step 4: automatic before comes from tracking, never from a default
        let before = if request.before == 0 {
            tracked
        } else {
            if request.before != tracked {
                log::warn!(
                    "{}: explicit before state {:#x} differs from tracked state {:#x}",
                    request.name,
                    request.before,
                    tracked
                );
            }
            request.before
        };

        // Step 5: a release hands ownership to the destination family right away
        // and leaves a pending entry for its acquire to match.
        Ok(match request.transfer {
            Some(QueueTransfer::Release { src_family, dst_family }) => Step {
                before,
                state: request.after,
                owner: dst_family,
                pending: PendingTransfer { src_family, dst_family, before }.encode(),
            },
            _ => Step {
                before,
                state: request.after,
                owner: ctx.family,
                pending: pending_out,
            },
        })
    }

    fn commit(&self, index: usize, step: &Step) {
        let entry = &self.subresources[index];
        entry.state.store(step.state, Ordering::Release);
        entry.owner.store(step.owner, Ordering::Release);
        entry.pending.store(step.pending, Ordering::Release);
    }
}

// =============================================================================
// RESOLUTION
// =============================================================================

/// One barrier as the planner sees it, with states as raw bits.
struct Request<'a> {
    name: &'a str,
    before: u32,
    after: u32,
    flags: ResourceBarrierFlags,
    transfer: Option<QueueTransfer>,
}

/// Planned outcome for one subresource, written back by `commit`.
struct Step {
    before: u32,
    state: u32,
    owner: u32,
    pending: u64,
}

/// Recording queue as seen by the tracker.
pub(crate) struct ResolveContext<'a> {
    pub family: u32,
    pub explicit_ownership: bool,
    /// Queue index to queue family.
    pub queue_families: &'a [u32],
}

impl ResolveContext<'_> {
    fn transfer(&self, ownership: OwnershipTransfer) -> RhiResult<Option<QueueTransfer>> {
        let family_of = |queue: u32| {
            self.queue_families
                .get(queue as usize)
                .copied()
                .ok_or_else(|| RhiError::bad_arguments(format!("queue index {} does not exist", queue)))
        };
        let transfer = match ownership {
            OwnershipTransfer::None => None,
            OwnershipTransfer::Release { dst_queue } => Some(QueueTransfer::Release {
                src_family: self.family,
                dst_family: family_of(dst_queue)?,
            }),
            OwnershipTransfer::Acquire { src_queue } => Some(QueueTransfer::Acquire {
                src_family: family_of(src_queue)?,
                dst_family: self.family,
            }),
        };
        // Same family on both sides needs no transfer at all.
        Ok(transfer.filter(|t| t.src_family() != t.dst_family()))
    }
}

/// Ownership movement after queue indices were mapped to families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueTransfer {
    Release { src_family: u32, dst_family: u32 },
    Acquire { src_family: u32, dst_family: u32 },
}

impl QueueTransfer {
    pub fn src_family(self) -> u32 {
        match self {
            Self::Release { src_family, .. } | Self::Acquire { src_family, .. } => src_family,
        }
    }

    pub fn dst_family(self) -> u32 {
        match self {
            Self::Release { dst_family, .. } | Self::Acquire { dst_family, .. } => dst_family,
        }
    }
}

/// A buffer barrier with `before` filled in, ready for native translation.
#[derive(Debug, Clone)]
pub struct ResolvedBufferBarrier {
    pub handle: u64,
    pub size: u64,
    pub before: BufferStateFlags,
    pub after: BufferStateFlags,
    pub flags: ResourceBarrierFlags,
    pub transfer: Option<QueueTransfer>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureTransition {
    pub mip_slice: u32,
    pub array_slice: u32,
    pub before: TextureStateFlags,
    pub after: TextureStateFlags,
}

#[derive(Debug, Clone)]
pub struct ResolvedTextureBarrier {
    pub handle: u64,
    pub format: Format,
    pub mip_levels: u32,
    pub array_size: u32,
    /// One entry per covered subresource, slice-major.
    pub transitions: Vec<TextureTransition>,
    pub flags: ResourceBarrierFlags,
    pub transfer: Option<QueueTransfer>,
}

impl ResolvedTextureBarrier {
    pub fn covers_all_subresources(&self) -> bool {
        self.transitions.len() == (self.mip_levels * self.array_size) as usize
    }
}

pub(crate) fn resolve_buffer_barrier(
    ctx: &ResolveContext<'_>,
    barrier: &BufferBarrier,
) -> RhiResult<ResolvedBufferBarrier> {
    let buffer = &barrier.buffer;
    let name = format!("buffer #{}", buffer.native_handle());
    if barrier.after.is_empty() {
        return Err(RhiError::bad_arguments(format!("{}: after state must not be automatic", name)));
    }
    if !buffer.allowed_states().contains(barrier.after) {
        return Err(RhiError::bad_arguments(format!(
            "{}: state {:?} is not allowed by usages {:?}",
            name,
            barrier.after,
            buffer.get_desc().usages
        )));
    }
    let transfer = ctx.transfer(barrier.ownership)?;
    let request = Request {
        name: &name,
        before: barrier.before.bits(),
        after: barrier.after.bits(),
        flags: barrier.flags,
        transfer,
    };
    let tracker = buffer.tracker();
    let step = tracker.plan(0, &request, ctx)?;
    tracker.commit(0, &step);

    Ok(ResolvedBufferBarrier {
        handle: buffer.native_handle(),
        size: buffer.get_desc().size,
        before: BufferStateFlags::from_bits_truncate(step.before),
        after: barrier.after,
        flags: barrier.flags,
        transfer,
    })
}

pub(crate) fn resolve_texture_barrier(
    ctx: &ResolveContext<'_>,
    barrier: &TextureBarrier,
) -> RhiResult<ResolvedTextureBarrier> {
    let texture = &barrier.texture;
    let desc = texture.get_desc();
    let name = format!("texture #{}", texture.native_handle());
    if barrier.after.is_empty() {
        return Err(RhiError::bad_arguments(format!("{}: after state must not be automatic", name)));
    }
    if !texture.allowed_states().contains(barrier.after) {
        return Err(RhiError::bad_arguments(format!(
            "{}: state {:?} is not allowed by usages {:?}",
            name, barrier.after, desc.usages
        )));
    }

    let mip_levels = desc.mip_levels;
    let indices: Vec<usize> = match barrier.subresource {
        SubresourceSelector::All => (0..texture.tracker().len()).collect(),
        SubresourceSelector::Single { mip_slice, array_slice } => {
            if mip_slice >= mip_levels || array_slice >= desc.array_size {
                return Err(RhiError::bad_arguments(format!(
                    "{}: subresource (mip {}, slice {}) out of range ({} mips, {} slices)",
                    name, mip_slice, array_slice, mip_levels, desc.array_size
                )));
            }
            vec![(mip_slice + array_slice * mip_levels) as usize]
        }
    };

    let transfer = ctx.transfer(barrier.ownership)?;
    let request = Request {
        name: &name,
        before: barrier.before.bits(),
        after: barrier.after.bits(),
        flags: barrier.flags,
        transfer,
    };
    // Plan every subresource before touching any of them: one rejected
    // subresource must leave the whole texture as it was.
    let tracker = texture.tracker();
    let steps = indices
        .iter()
        .map(|&i| tracker.plan(i, &request, ctx))
        .collect::<RhiResult<Vec<_>>>()?;

    let mut transitions = Vec::with_capacity(indices.len());
    for (&i, step) in indices.iter().zip(&steps) {
        tracker.commit(i, step);
        transitions.push(TextureTransition {
            mip_slice: i as u32 % mip_levels,
            array_slice: i as u32 / mip_levels,
            before: TextureStateFlags::from_bits_truncate(step.before),
            after: barrier.after,
        });
    }

    Ok(ResolvedTextureBarrier {
        handle: texture.native_handle(),
        format: desc.format,
        mip_levels,
        array_size: desc.array_size,
        transitions,
        flags: barrier.flags,
        transfer,
    })
}

// =============================================================================
// SUBRESOURCE RANGES
// =============================================================================

/// Rectangular block of subresources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubresourceRange {
    pub base_mip_level: u32,
    pub level_count: u32,
    pub base_array_layer: u32,
    pub layer_count: u32,
}

/// Merges `(mip_slice, array_slice)` pairs, sorted slice-major, into ranges:
/// contiguous mips within a slice first, then adjacent slices that carry
/// identical mip runs.
pub fn merge_subresource_ranges(subresources: &[(u32, u32)]) -> Vec<SubresourceRange> {
    let mut runs: Vec<SubresourceRange> = Vec::new();
    for &(mip, slice) in subresources {
        if let Some(last) = runs.last_mut() {
            if last.base_array_layer == slice && last.base_mip_level + last.level_count == mip {
                last.level_count += 1;
                continue;
            }
        }
        runs.push(SubresourceRange {
            base_mip_level: mip,
            level_count: 1,
            base_array_layer: slice,
            layer_count: 1,
        });
    }

    let mut merged: Vec<SubresourceRange> = Vec::with_capacity(runs.len());
    for run in runs {
        let neighbour = merged.iter_mut().rev().find(|m| {
            m.base_mip_level == run.base_mip_level
                && m.level_count == run.level_count
                && m.base_array_layer + m.layer_count == run.base_array_layer
        });
        match neighbour {
            Some(m) => m.layer_count += 1,
            None => merged.push(run),
        }
    }
    merged
}
