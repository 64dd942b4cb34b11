mod common;

use common::*;
use sluice::{
    mock::{FenceMode, MockDevice},
    vk, CommandProcessor, CommandQueue, PresentInfo, Priority, ProtectionType, ResourceUse, SchedulerConfig,
    SubmitPolicy, SwapchainStatus,
};
use sluice::ash::vk::Handle;
use std::sync::Arc;

const UNPROTECTED: ProtectionType = ProtectionType::Unprotected;

/// A processor whose worker thread isn't started: tasks only run when drained by the caller.
fn idle_processor(mock: &Arc<MockDevice>, task_queue_capacity: usize) -> (Arc<CommandQueue>, CommandProcessor) {
    let device: sluice::DeviceRef = mock.clone();
    let config = SchedulerConfig {
        task_queue_capacity,
        ..SchedulerConfig::default()
    };
    let queue = Arc::new(create_queue(&device, config.clone()));
    let processor = CommandProcessor::new(queue.clone(), config);
    (queue, processor)
}

fn submitted_tags(mock: &MockDevice) -> Vec<vk::Semaphore> {
    mock.submits().iter().flat_map(|s| s.wait_semaphores.clone()).collect()
}

fn present_info() -> PresentInfo {
    PresentInfo::new(vk::SwapchainKHR::from_raw(0x5c), 0)
}

#[test]
fn full_task_queue_drains_one_task_inline() {
    let (mock, _) = mock_device(FenceMode::AutoSignal);
    let (queue, processor) = idle_processor(&mock, 2);
    let serials = serials(&queue, 3);

    for (i, &serial) in serials.iter().enumerate() {
        processor
            .enqueue_submit_one_off_commands(
                UNPROTECTED,
                Priority::Medium,
                None,
                tag(i as u64 + 1),
                SubmitPolicy::AllowDeferred,
                serial,
            )
            .unwrap();
    }

    // the third enqueue made room by running the first task
    assert_eq!(submitted_tags(&mock), vec![semaphore(1)]);
    assert_eq!(processor.pending_task_count(), 2);
    assert!(processor.has_resource_use_enqueued(&ResourceUse::from(serials[2])));

    processor.wait_for_all_work_to_be_submitted().unwrap();
    assert_eq!(submitted_tags(&mock), vec![semaphore(1), semaphore(2), semaphore(3)]);
    assert_eq!(queue.last_submitted_serial(serials[2].index), serials[2].serial);
}

#[test]
fn ensure_submitted_drains_up_to_the_serial() {
    let (mock, _) = mock_device(FenceMode::AutoSignal);
    let (queue, processor) = idle_processor(&mock, 8);
    let serials = serials(&queue, 3);

    for (i, &serial) in serials[..2].iter().enumerate() {
        processor
            .enqueue_submit_one_off_commands(
                UNPROTECTED,
                Priority::Medium,
                None,
                tag(i as u64 + 1),
                SubmitPolicy::AllowDeferred,
                serial,
            )
            .unwrap();
    }
    processor
        .enqueue_submit_one_off_commands(
            UNPROTECTED,
            Priority::Medium,
            None,
            tag(3),
            SubmitPolicy::EnsureSubmitted,
            serials[2],
        )
        .unwrap();

    assert!(queue.has_resource_use_submitted(&ResourceUse::from(serials[2])));
    assert_eq!(processor.pending_task_count(), 0);
    assert_eq!(submitted_tags(&mock), vec![semaphore(1), semaphore(2), semaphore(3)]);
}

#[test]
fn errors_from_drained_tasks_are_reported_later() {
    let (mock, _) = mock_device(FenceMode::AutoSignal);
    let (queue, processor) = idle_processor(&mock, 1);
    let serials = serials(&queue, 2);

    mock.fail_next_submit(vk::Result::ERROR_OUT_OF_HOST_MEMORY);
    for &serial in &serials {
        processor
            .enqueue_submit_one_off_commands(UNPROTECTED, Priority::Medium, None, None, SubmitPolicy::AllowDeferred, serial)
            .unwrap();
    }

    // the second task was still enqueued
    assert_eq!(processor.pending_task_count(), 1);
    assert!(processor.has_pending_error());

    let err = processor.check_and_pop_pending_error().unwrap_err();
    assert_eq!(err.vk_result(), Some(vk::Result::ERROR_OUT_OF_HOST_MEMORY));
    processor.check_and_pop_pending_error().unwrap();

    processor.wait_for_all_work_to_be_submitted().unwrap();
    assert!(queue.has_resource_use_submitted(&ResourceUse::from(serials[1])));
}

#[test]
fn pending_error_fails_next_enqueue() {
    let (mock, _) = mock_device(FenceMode::AutoSignal);
    let (queue, processor) = idle_processor(&mock, 1);
    let serials = serials(&queue, 3);

    mock.fail_next_submit(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
    for &serial in &serials[..2] {
        processor
            .enqueue_submit_one_off_commands(UNPROTECTED, Priority::Medium, None, None, SubmitPolicy::AllowDeferred, serial)
            .unwrap();
    }

    let err = processor
        .enqueue_submit_commands(UNPROTECTED, Priority::Medium, None, None, serials[2])
        .unwrap_err();
    assert_eq!(err.vk_result(), Some(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
}

#[test]
fn device_loss_discards_later_tasks() {
    let (mock, _) = mock_device(FenceMode::AutoSignal);
    let (queue, processor) = idle_processor(&mock, 1);
    let serials = serials(&queue, 2);

    mock.fail_next_submit(vk::Result::ERROR_DEVICE_LOST);
    for &serial in &serials {
        processor
            .enqueue_submit_one_off_commands(UNPROTECTED, Priority::Medium, None, None, SubmitPolicy::AllowDeferred, serial)
            .unwrap();
    }
    assert!(processor.is_device_lost());
    assert!(queue.is_device_lost());

    let err = processor.wait_for_all_work_to_be_submitted().unwrap_err();
    assert!(err.is_device_lost());

    // the second submission is dropped, and presents resolve as lost
    processor.wait_for_all_work_to_be_submitted().unwrap();
    let status = Arc::new(SwapchainStatus::new());
    processor
        .enqueue_present(Priority::Medium, present_info(), status.clone())
        .unwrap();
    processor.wait_for_present_to_be_submitted(&status).unwrap();
    assert!(!status.is_pending());
    assert_eq!(status.last_present_result(), vk::Result::ERROR_DEVICE_LOST);
    assert!(mock.submits().is_empty());
}

#[test]
fn out_of_date_present_is_not_an_error() {
    let (mock, _) = mock_device(FenceMode::AutoSignal);
    let (_queue, processor) = idle_processor(&mock, 4);
    mock.set_present_result(vk::Result::ERROR_OUT_OF_DATE_KHR);

    let status = Arc::new(SwapchainStatus::new());
    processor
        .enqueue_present(Priority::Medium, present_info(), status.clone())
        .unwrap();
    assert!(status.is_pending());
    assert_eq!(status.last_present_result(), vk::Result::SUCCESS);

    processor.wait_for_present_to_be_submitted(&status).unwrap();
    assert!(!status.is_pending());
    assert_eq!(status.last_present_result(), vk::Result::ERROR_OUT_OF_DATE_KHR);
    processor.check_and_pop_pending_error().unwrap();
}

#[test]
fn failed_present_is_reported_without_stopping_the_drain() {
    let (mock, _) = mock_device(FenceMode::AutoSignal);
    let (queue, processor) = idle_processor(&mock, 4);
    let serial = serials(&queue, 1)[0];
    mock.set_present_result(vk::Result::ERROR_SURFACE_LOST_KHR);

    let status = Arc::new(SwapchainStatus::new());
    processor
        .enqueue_present(Priority::Medium, present_info(), status.clone())
        .unwrap();
    processor
        .enqueue_submit_one_off_commands(UNPROTECTED, Priority::Medium, None, tag(1), SubmitPolicy::AllowDeferred, serial)
        .unwrap();

    // the submission behind the failed present still goes through
    processor
        .wait_for_resource_use_to_be_submitted(&ResourceUse::from(serial))
        .unwrap();
    assert!(queue.has_resource_use_submitted(&ResourceUse::from(serial)));
    assert_eq!(processor.pending_task_count(), 0);
    assert!(!status.is_pending());
    assert_eq!(status.last_present_result(), vk::Result::ERROR_SURFACE_LOST_KHR);

    let err = processor.check_and_pop_pending_error().unwrap_err();
    assert_eq!(err.vk_result(), Some(vk::Result::ERROR_SURFACE_LOST_KHR));
    processor.check_and_pop_pending_error().unwrap();
}

#[test]
fn pending_error_is_reported_by_the_present_path() {
    let (mock, _) = mock_device(FenceMode::AutoSignal);
    let (queue, processor) = idle_processor(&mock, 1);
    let serials = serials(&queue, 2);

    // queued by the inline drain of the second enqueue
    mock.fail_next_submit(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
    for &serial in &serials {
        processor
            .enqueue_submit_one_off_commands(UNPROTECTED, Priority::Medium, None, None, SubmitPolicy::AllowDeferred, serial)
            .unwrap();
    }
    let status = Arc::new(SwapchainStatus::new());
    let err = processor
        .enqueue_present(Priority::Medium, present_info(), status.clone())
        .unwrap_err();
    assert_eq!(err.vk_result(), Some(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
    assert!(!status.is_pending());

    // the queued submission fails while making room for the present
    mock.fail_next_submit(vk::Result::ERROR_OUT_OF_HOST_MEMORY);
    processor
        .enqueue_present(Priority::Medium, present_info(), status.clone())
        .unwrap();
    assert!(processor.has_pending_error());

    let err = processor.wait_for_present_to_be_submitted(&status).unwrap_err();
    assert_eq!(err.vk_result(), Some(vk::Result::ERROR_OUT_OF_HOST_MEMORY));
    assert!(status.is_pending());

    processor.wait_for_present_to_be_submitted(&status).unwrap();
    assert!(!status.is_pending());
    assert!(mock.submits().is_empty());
}

#[test]
fn waits_only_drain_up_to_what_they_wait_for() {
    let (mock, _) = mock_device(FenceMode::AutoSignal);
    let (queue, processor) = idle_processor(&mock, 8);
    let serials = serials(&queue, 3);
    let status = Arc::new(SwapchainStatus::new());

    processor
        .enqueue_submit_one_off_commands(UNPROTECTED, Priority::Medium, None, tag(1), SubmitPolicy::AllowDeferred, serials[0])
        .unwrap();
    processor
        .enqueue_present(Priority::Medium, present_info(), status.clone())
        .unwrap();
    for (i, &serial) in serials[1..].iter().enumerate() {
        processor
            .enqueue_submit_one_off_commands(
                UNPROTECTED,
                Priority::Medium,
                None,
                tag(i as u64 + 2),
                SubmitPolicy::AllowDeferred,
                serial,
            )
            .unwrap();
    }

    processor
        .wait_for_resource_use_to_be_submitted(&ResourceUse::from(serials[0]))
        .unwrap();
    assert_eq!(submitted_tags(&mock), vec![semaphore(1)]);
    assert!(status.is_pending());
    assert_eq!(processor.pending_task_count(), 3);

    processor.wait_for_present_to_be_submitted(&status).unwrap();
    assert!(!status.is_pending());
    assert_eq!(submitted_tags(&mock), vec![semaphore(1)]);
    assert_eq!(processor.pending_task_count(), 2);

    // tasks behind the awaited serial stay queued
    processor
        .wait_for_resource_use_to_be_submitted(&ResourceUse::from(serials[1]))
        .unwrap();
    assert_eq!(submitted_tags(&mock), vec![semaphore(1), semaphore(2)]);
    assert!(!queue.has_resource_use_submitted(&ResourceUse::from(serials[2])));
    assert_eq!(processor.pending_task_count(), 1);

    processor.wait_for_all_work_to_be_submitted().unwrap();
    assert_eq!(submitted_tags(&mock), vec![semaphore(1), semaphore(2), semaphore(3)]);
}

#[test]
#[should_panic(expected = "a present is already pending")]
fn present_while_pending_panics() {
    let (mock, _) = mock_device(FenceMode::AutoSignal);
    let (_queue, processor) = idle_processor(&mock, 4);
    let status = Arc::new(SwapchainStatus::new());
    processor
        .enqueue_present(Priority::Medium, present_info(), status.clone())
        .unwrap();
    processor
        .enqueue_present(Priority::Medium, present_info(), status.clone())
        .unwrap();
}

#[test]
fn worker_executes_tasks_in_order() {
    let (mock, _) = mock_device(FenceMode::AutoSignal);
    let (queue, processor) = idle_processor(&mock, 4);
    processor.init().unwrap();
    let serials = serials(&queue, 32);

    for (i, &serial) in serials.iter().enumerate() {
        processor
            .enqueue_submit_one_off_commands(
                UNPROTECTED,
                Priority::Medium,
                None,
                tag(i as u64 + 1),
                SubmitPolicy::AllowDeferred,
                serial,
            )
            .unwrap();
    }
    processor.destroy();

    let expected: Vec<_> = (1..=32).map(semaphore).collect();
    assert_eq!(submitted_tags(&mock), expected);
    assert_eq!(processor.pending_task_count(), 0);
}

#[test]
fn concurrent_producers_keep_per_stream_order() {
    let (mock, _) = mock_device(FenceMode::AutoSignal);
    let (queue, processor) = idle_processor(&mock, 4);
    processor.init().unwrap();
    let processor = Arc::new(processor);

    let producers: Vec<_> = (0..4u64)
        .map(|p| {
            let queue = queue.clone();
            let processor = processor.clone();
            std::thread::spawn(move || {
                let serials = serials(&queue, 16);
                for (i, &serial) in serials.iter().enumerate() {
                    processor
                        .enqueue_submit_one_off_commands(
                            UNPROTECTED,
                            Priority::Medium,
                            None,
                            tag(p * 100 + i as u64 + 1),
                            SubmitPolicy::AllowDeferred,
                            serial,
                        )
                        .unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }
    processor.wait_for_all_work_to_be_submitted().unwrap();

    let tags = submitted_tags(&mock);
    assert_eq!(tags.len(), 64);
    for p in 0..4u64 {
        let stream: Vec<_> = tags
            .iter()
            .map(|s| s.as_raw())
            .filter(|raw| (p * 100 + 1..=p * 100 + 16).contains(raw))
            .collect();
        let expected: Vec<_> = (p * 100 + 1..=p * 100 + 16).collect();
        assert_eq!(stream, expected);
    }
    processor.destroy();
}
