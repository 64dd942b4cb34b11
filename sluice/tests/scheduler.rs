mod common;

use common::*;
use sluice::{
    mock::{FenceMode, MockDevice, MockSecondaryPool},
    vk, GarbageList, NoGarbage, OutsideRenderPassCommands, PresentInfo, Priority, ProtectionType, ResourceUse,
    Scheduler, SchedulerConfig, SchedulerFeatures, SecondaryCommandBufferCollector, SubmitPolicy, SwapchainStatus,
};
use sluice::ash::vk::Handle;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

const UNPROTECTED: ProtectionType = ProtectionType::Unprotected;

fn scheduler(mock: &Arc<MockDevice>, config: SchedulerConfig) -> Scheduler {
    Scheduler::new(mock.clone(), config, &queue_family(3), false, 3, Arc::new(NoGarbage)).unwrap()
}

fn async_configs() -> Vec<SchedulerConfig> {
    vec![
        SchedulerConfig::synchronous(),
        SchedulerConfig {
            features: SchedulerFeatures::ASYNC_COMMAND_QUEUE,
            ..Default::default()
        },
        SchedulerConfig {
            features: SchedulerFeatures::ASYNC_COMMAND_QUEUE
                | SchedulerFeatures::ASYNC_CLEANUP
                | SchedulerFeatures::SLOW_ASYNC_COMMAND_QUEUE_FOR_TESTING,
            ..Default::default()
        },
    ]
}

#[test]
fn submit_and_finish_in_every_mode() {
    for config in async_configs() {
        let (mock, _) = mock_device(FenceMode::AutoSignal);
        let scheduler = scheduler(&mock, config.clone());
        assert_eq!(scheduler.is_async(), config.is_async());

        let secondary_pool = MockSecondaryPool::new();
        let index = scheduler.allocate_queue_serial_index().unwrap();
        let mut last = None;
        for _ in 0..4 {
            let mut secondaries = SecondaryCommandBufferCollector::new();
            secondaries.collect(secondary_pool.allocate());
            scheduler
                .flush_outside_render_pass_commands(UNPROTECTED, Priority::Medium, OutsideRenderPassCommands::new(secondaries))
                .unwrap();
            let serial = scheduler.generate_queue_serial(index);
            scheduler
                .submit_commands(UNPROTECTED, Priority::Medium, None, None, serial)
                .unwrap();
            last = Some(serial);
        }

        let last = last.unwrap();
        scheduler.finish_queue_serial(last).unwrap();
        assert!(scheduler.has_resource_use_finished(&ResourceUse::from(last)));
        assert_eq!(mock.submits().len(), 4);
        assert_eq!(scheduler.perf_counters().vk_queue_submit_calls_total, 4);

        scheduler.wait_idle().unwrap();
        assert!(!scheduler.is_busy());
        scheduler.release_queue_serial_index(index);

        drop(scheduler);
        assert_eq!(secondary_pool.collected().len(), 4);
        assert_eq!(mock.live_command_buffer_count(), 0);
        assert_eq!(mock.live_fence_count(), 0);
    }
}

#[test]
fn one_off_submission_is_submitted_on_return_when_ensured() {
    let (mock, _) = mock_device(FenceMode::Manual);
    let scheduler = scheduler(&mock, SchedulerConfig::default());
    let index = scheduler.allocate_queue_serial_index().unwrap();
    let serial = scheduler.generate_queue_serial(index);

    scheduler
        .submit_one_off_commands(UNPROTECTED, Priority::High, None, tag(9), SubmitPolicy::EnsureSubmitted, serial)
        .unwrap();
    assert!(scheduler.has_resource_use_submitted(&ResourceUse::from(serial)));
    assert_eq!(mock.submits()[0].wait_semaphores, vec![semaphore(9)]);
    assert!(scheduler.is_busy());

    mock.signal_all();
    scheduler.finish_queue_serial(serial).unwrap();
    assert!(!scheduler.is_busy());
}

#[test]
fn present_in_every_mode() {
    for config in async_configs() {
        let (mock, _) = mock_device(FenceMode::AutoSignal);
        mock.set_present_result(vk::Result::SUBOPTIMAL_KHR);
        let scheduler = scheduler(&mock, config);
        let status = Arc::new(SwapchainStatus::new());

        let info = PresentInfo::new(vk::SwapchainKHR::from_raw(0x5c), 1);
        scheduler.queue_present(Priority::Medium, info.clone(), &status);
        scheduler.wait_for_present_to_be_submitted(&status).unwrap();
        assert!(!status.is_pending());
        assert_eq!(status.last_present_result(), vk::Result::SUBOPTIMAL_KHR);

        // the status can be reused once the present has been issued
        scheduler.queue_present(Priority::Medium, info, &status);
        scheduler.wait_for_present_to_be_submitted(&status).unwrap();
        scheduler.check_pending_error().unwrap();
    }
}

#[test]
fn present_returns_an_error_raised_on_the_submission_thread() {
    let (mock, _) = mock_device(FenceMode::AutoSignal);
    let scheduler = scheduler(&mock, SchedulerConfig::default());
    let index = scheduler.allocate_queue_serial_index().unwrap();
    let serial = scheduler.generate_queue_serial(index);

    mock.fail_next_submit(vk::Result::ERROR_OUT_OF_HOST_MEMORY);
    scheduler
        .submit_one_off_commands(UNPROTECTED, Priority::Medium, None, None, SubmitPolicy::AllowDeferred, serial)
        .unwrap();

    let processor = scheduler.processor().unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while !processor.has_pending_error() {
        assert!(Instant::now() < deadline, "the submission never failed");
        thread::yield_now();
    }

    let status = Arc::new(SwapchainStatus::new());
    let info = PresentInfo::new(vk::SwapchainKHR::from_raw(0x5c), 0);
    assert_eq!(
        scheduler.queue_present(Priority::Medium, info.clone(), &status),
        vk::Result::ERROR_OUT_OF_HOST_MEMORY
    );
    assert!(!status.is_pending());

    // reported once
    assert_eq!(scheduler.queue_present(Priority::Medium, info, &status), vk::Result::SUCCESS);
    scheduler.wait_for_present_to_be_submitted(&status).unwrap();
    assert!(!status.is_pending());
}

#[test]
fn synchronous_device_loss_completes_everything() {
    let (mock, _) = mock_device(FenceMode::Manual);
    let scheduler = scheduler(&mock, SchedulerConfig::synchronous());
    let index = scheduler.allocate_queue_serial_index().unwrap();
    let first = scheduler.generate_queue_serial(index);
    let second = scheduler.generate_queue_serial(index);

    scheduler
        .submit_one_off_commands(UNPROTECTED, Priority::Medium, None, None, SubmitPolicy::AllowDeferred, first)
        .unwrap();
    mock.fail_next_submit(vk::Result::ERROR_DEVICE_LOST);
    let err = scheduler
        .submit_one_off_commands(UNPROTECTED, Priority::Medium, None, None, SubmitPolicy::AllowDeferred, second)
        .unwrap_err();
    assert!(err.is_device_lost());
    assert!(scheduler.queue().is_device_lost());

    // waits tolerate the lost device
    scheduler.finish_queue_serial(first).unwrap();
    assert!(!scheduler.is_busy());
}

#[test]
fn garbage_is_freed_once_its_use_completes() {
    let (mock, _) = mock_device(FenceMode::AutoSignal);
    let garbage = Arc::new(GarbageList::new());
    let scheduler = Scheduler::new(
        mock.clone(),
        SchedulerConfig::default(),
        &queue_family(3),
        false,
        3,
        garbage.clone(),
    )
    .unwrap();
    let index = scheduler.allocate_queue_serial_index().unwrap();
    let serial = scheduler.generate_queue_serial(index);

    let destroyed = Arc::new(AtomicBool::new(false));
    garbage.add(ResourceUse::from(serial), 64, {
        let destroyed = destroyed.clone();
        move || destroyed.store(true, Ordering::Release)
    });
    scheduler
        .submit_one_off_commands(UNPROTECTED, Priority::Low, None, None, SubmitPolicy::AllowDeferred, serial)
        .unwrap();
    scheduler.wait_idle().unwrap();

    // released on the submission thread, or at the latest when the scheduler is dropped
    drop(scheduler);
    assert!(destroyed.load(Ordering::Acquire));
    assert!(garbage.is_empty());
}
