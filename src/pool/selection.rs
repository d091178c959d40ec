//! Pure selection logic (spec.md §4.3 steps 1-5), separated from locking and
//! I/O so it can be unit-tested without an engine or a runtime.

use std::collections::HashMap;

use crate::instance::Instance;

pub enum Outcome {
    /// An idle instance id was chosen, tagged with which step (1, 2, or 4) matched.
    Ready(String, u8),
    /// No cache-hit/empty-idle candidate; live count is under the per-model
    /// cap, so a new instance is spawned rather than cannibalizing an idle
    /// one (step 3).
    Spawn,
    /// No idle candidate and at capacity; caller must wait (step 5).
    Wait,
}

/// Run selection over the current instance map in spec.md §4.3 order:
/// context-cache hit (1) → empty-idle (2) → spawn-under-cap (3) →
/// LRU-with-reset (4) → wait (5). An idle cached instance is only
/// cannibalized by step 4 once the model is already at `max_instances`, so a
/// spawn is always preferred over reusing one while the model is under cap.
/// Mutates the chosen instance's `needs_reset` flag for the step-4 case,
/// matching `reset()` being called as part of selection in spec.md §4.3.
pub fn select(
    instances: &mut HashMap<String, Instance>,
    model_id: &str,
    require_gpu: Option<bool>,
    context_hash: Option<&str>,
    max_instances: u32,
) -> Outcome {
    let idle_ids: Vec<String> = instances
        .values()
        .filter(|i| {
            i.status == crate::instance::InstanceStatus::Idle
                && i.matches_requirements(model_id, require_gpu)
        })
        .map(|i| i.id.clone())
        .collect();

    // Step 1: context-cache hit, freshest wins.
    if let Some(hash) = context_hash {
        if let Some(best) = idle_ids
            .iter()
            .filter(|id| instances[*id].matches_context_state(hash))
            .max_by_key(|id| instances[*id].last_used_at)
        {
            return Outcome::Ready(best.clone(), 1);
        }
    }

    // Step 2: idle instance with no cached context at all.
    if let Some(best) = idle_ids
        .iter()
        .find(|id| instances[*id].context_state_hash.is_none())
    {
        return Outcome::Ready(best.clone(), 2);
    }

    let live_count = instances
        .values()
        .filter(|i| {
            i.model_id == model_id && !matches!(i.status, crate::instance::InstanceStatus::Disposing)
        })
        .count();

    // Step 3: spawn rather than reuse, while the model is under its cap.
    if live_count < max_instances as usize {
        return Outcome::Spawn;
    }

    // Step 4: at cap, so fall back to the least-recently-used idle instance,
    // reset on the way out.
    if let Some(best) = idle_ids.iter().min_by_key(|id| instances[*id].last_used_at) {
        let id = best.clone();
        instances.get_mut(&id).expect("just looked up").reset();
        return Outcome::Ready(id, 4);
    }

    // Step 5: at cap and no idle instance at all (every live instance busy).
    Outcome::Wait
}
