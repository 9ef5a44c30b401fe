#![cfg(not(target_arch = "wasm32"))]

//! Frame pipelining laws, driven against the null backend's manual fence
//! clock.

use std::sync::Arc;

use proptest::prelude::*;
use xenos_gpu::backend::{FenceMode, ResourceState};
use xenos_gpu::{
    CommandProcessor, CommandProcessorConfig, NullBackend, NullShaderTranslator, VecGuestMemory,
};

const MEMORY_SIZE: usize = 1 << 20;

#[derive(Debug, Clone, Copy)]
enum Step {
    Begin,
    End,
    /// Lets the GPU finish every submission except the newest `keep`.
    Retire { keep: u64 },
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => Just(Step::Begin),
        3 => Just(Step::End),
        2 => (0u64..4).prop_map(|keep| Step::Retire { keep }),
    ]
}

fn processor(frames_in_flight: usize) -> CommandProcessor<NullBackend> {
    let config = CommandProcessorConfig {
        frames_in_flight,
        shared_memory_size: MEMORY_SIZE as u64,
        scratch_increment: 1 << 16,
        ..CommandProcessorConfig::default()
    };
    CommandProcessor::new(
        NullBackend::new(FenceMode::Manual),
        Arc::new(VecGuestMemory::new(MEMORY_SIZE)),
        config,
        Box::new(NullShaderTranslator),
    )
    .unwrap()
}

fn apply(cp: &mut CommandProcessor<NullBackend>, step: Step) {
    match step {
        Step::Begin => {
            cp.begin_frame().unwrap();
        }
        Step::End => {
            cp.end_frame().unwrap();
        }
        Step::Retire { keep } => {
            let backend = cp.backend_mut();
            let target = backend.submitted_fence().saturating_sub(keep);
            backend.retire_through(target);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn unretired_frames_never_exceed_frames_in_flight(
        frames_in_flight in 1usize..5,
        steps in prop::collection::vec(step(), 1..64),
    ) {
        let mut cp = processor(frames_in_flight);
        for step in steps {
            apply(&mut cp, step);
            prop_assert!(cp.backend().frames_in_flight() <= frames_in_flight as u64);
        }
    }

    #[test]
    fn deferred_objects_outlive_their_frame_by_frames_in_flight(
        frames_in_flight in 1usize..5,
        steps in prop::collection::vec(step(), 1..64),
    ) {
        let mut cp = processor(frames_in_flight);
        cp.begin_frame().unwrap();
        let queued_at = cp.frame_current();
        let small = cp.request_scratch_gpu_buffer(1 << 10, ResourceState::COPY_DEST).unwrap();
        cp.release_scratch_gpu_buffer(small, ResourceState::COPY_DEST);
        let large = cp.request_scratch_gpu_buffer(1 << 20, ResourceState::COPY_DEST).unwrap();
        cp.release_scratch_gpu_buffer(large, ResourceState::COPY_DEST);
        prop_assert_eq!(cp.pending_deletions(), 1);

        for step in steps {
            apply(&mut cp, step);
            if cp.backend().destroyed_resources().contains(&small) {
                prop_assert!(cp.frame_completed() >= queued_at + frames_in_flight as u64);
            }
        }
    }
}

#[test]
fn begin_frame_waits_for_the_slot_being_reused() {
    let mut cp = processor(3);
    for _ in 0..3 {
        assert!(cp.begin_frame().unwrap());
        assert!(cp.end_frame().unwrap());
    }
    assert!(cp.backend().fence_waits().is_empty());
    assert_eq!(cp.backend().frames_in_flight(), 3);

    assert!(cp.begin_frame().unwrap());
    assert_eq!(cp.backend().fence_waits(), &[1]);
    assert!(!cp.begin_frame().unwrap());
    assert!(cp.end_frame().unwrap());
    assert!(!cp.end_frame().unwrap());
    assert_eq!(cp.frame_current(), 5);
}

#[test]
fn shutdown_releases_everything_queued() {
    let mut cp = processor(2);
    cp.begin_frame().unwrap();
    let small = cp
        .request_scratch_gpu_buffer(1 << 10, ResourceState::COPY_DEST)
        .unwrap();
    cp.release_scratch_gpu_buffer(small, ResourceState::COPY_DEST);
    let large = cp
        .request_scratch_gpu_buffer(1 << 20, ResourceState::COPY_DEST)
        .unwrap();
    cp.release_scratch_gpu_buffer(large, ResourceState::COPY_DEST);

    cp.shutdown().unwrap();
    assert_eq!(cp.pending_deletions(), 0);
    let destroyed = cp.backend().destroyed_resources();
    assert!(destroyed.contains(&small));
    assert!(destroyed.contains(&large));
}
