//! Converter pool behaviour against a scripted office suite.
//!
//! Every test runs the pool on the test thread inside a host apartment, the
//! way a worker thread does.

mod common;

use common::{fast_config, Fault, FakeWorld, Inputs};
use office_pdf_core::config::{ConversionMode, ConversionRequest, ConverterConfig};
use office_pdf_core::error::{FailureCategory, InterfaceCode};
use office_pdf_core::host::{HostKind, HostOptions, ObjectType};
use office_pdf_core::pool::ConverterPool;
use office_pdf_core::registry::ProcessOrigin;
use office_pdf_core::session::SessionState;
use office_pdf_core::ApartmentGuard;
use std::time::Duration;

fn pool(world: &FakeWorld, config: &ConverterConfig) -> ConverterPool {
    ConverterPool::new(
        world.services(config),
        config.pool.clone(),
        HostOptions::automation(),
    )
}

fn batch(inputs: &Inputs, name: &str) -> ConversionRequest {
    ConversionRequest::beside_input(inputs.file(name)).with_mode(ConversionMode::Batch)
}

// ============================================================================
// Single-use conversions
// ============================================================================

#[test]
fn test_single_use_conversion_leaves_nothing_behind() {
    let _apartment = ApartmentGuard::enter();
    let world = FakeWorld::new();
    let config = fast_config();
    let mut pool = pool(&world, &config);
    let inputs = Inputs::new();

    let request = ConversionRequest::beside_input(inputs.file("report.docx"));
    let result = pool.convert(&request);

    assert!(result.success, "{:?}", result.error_message);
    assert_eq!(result.output_path, Some(inputs.path("report.pdf")));
    assert!(inputs.path("report.pdf").exists());
    assert!(result.report().is_none());

    assert_eq!(pool.state(HostKind::Word), SessionState::Absent);
    assert!(pool.session(HostKind::Word).is_none());
    assert!(world.host_pids().is_empty(), "host process must be gone");
    assert!(pool.services().registry.app_created(None).is_empty());
    assert_eq!(pool.services().ledger.outstanding(), 0);
    assert_eq!(world.live_objects(), 0);

    let stats = pool.stats();
    assert_eq!(stats.sessions_created, 1);
    assert_eq!(stats.sessions_retired, 1);
    assert_eq!(stats.conversions_succeeded, 1);
}

#[test]
fn test_spreadsheet_uses_excel_session() {
    let _apartment = ApartmentGuard::enter();
    let world = FakeWorld::new();
    let config = fast_config();
    let mut pool = pool(&world, &config);
    let inputs = Inputs::new();

    let result = pool.convert(&ConversionRequest::beside_input(inputs.file("budget.xlsx")));

    assert!(result.success, "{:?}", result.error_message);
    assert_eq!(world.hosts_created(HostKind::Excel), 1);
    assert_eq!(world.hosts_created(HostKind::Word), 0);
    let types: Vec<ObjectType> = world.release_log().iter().map(|(_, t)| *t).collect();
    assert!(types.contains(&ObjectType::Workbook));
    assert!(types.contains(&ObjectType::Workbooks));
}

#[test]
fn test_output_directory_is_created() {
    let _apartment = ApartmentGuard::enter();
    let world = FakeWorld::new();
    let config = fast_config();
    let mut pool = pool(&world, &config);
    let inputs = Inputs::new();

    let output = inputs.path("out/nested/report.pdf");
    let result = pool.convert(&ConversionRequest::new(inputs.file("report.docx"), &output));

    assert!(result.success, "{:?}", result.error_message);
    assert!(output.exists());
}

// ============================================================================
// Session reuse and recycling
// ============================================================================

#[test]
fn test_batch_reuses_session() {
    let _apartment = ApartmentGuard::enter();
    let world = FakeWorld::new();
    let config = fast_config();
    let mut pool = pool(&world, &config);
    let inputs = Inputs::new();

    for i in 0..5 {
        let result = pool.convert(&batch(&inputs, &format!("doc{}.docx", i)));
        assert!(result.success);
    }

    assert_eq!(world.hosts_created(HostKind::Word), 1);
    assert_eq!(pool.state(HostKind::Word), SessionState::Ready);
    assert_eq!(pool.session(HostKind::Word).map(|s| s.use_count()), Some(5));

    pool.finish_batch();
    assert_eq!(pool.state(HostKind::Word), SessionState::Absent);
    assert_eq!(pool.services().ledger.outstanding(), 0);
    assert!(world.host_pids().is_empty());
}

#[test]
fn test_use_ceiling_recycles_exactly_once() {
    let _apartment = ApartmentGuard::enter();
    let world = FakeWorld::new();
    let mut config = fast_config();
    config.pool.max_uses_per_session = 3;
    let mut pool = pool(&world, &config);
    let inputs = Inputs::new();

    for i in 0..3 {
        assert!(pool.convert(&batch(&inputs, &format!("doc{}.docx", i))).success);
    }
    assert_eq!(world.hosts_created(HostKind::Word), 1);
    let first_pid = pool.session(HostKind::Word).and_then(|s| s.pid());

    assert!(pool.convert(&batch(&inputs, "doc3.docx")).success);
    assert_eq!(world.hosts_created(HostKind::Word), 2);
    assert_eq!(pool.stats().sessions_retired, 1);

    let session = pool.session(HostKind::Word).expect("live session");
    assert_eq!(session.generation(), 2);
    assert_eq!(session.use_count(), 1);
    assert_ne!(session.pid(), first_pid);
    assert!(!world.is_alive(first_pid.unwrap()));
}

#[test]
fn test_idle_session_is_recycled() {
    let _apartment = ApartmentGuard::enter();
    let world = FakeWorld::new();
    let mut config = fast_config();
    config.pool.idle_timeout = Duration::from_millis(10);
    let mut pool = pool(&world, &config);
    let inputs = Inputs::new();

    assert!(pool.convert(&batch(&inputs, "a.docx")).success);
    std::thread::sleep(Duration::from_millis(30));
    assert!(pool.convert(&batch(&inputs, "b.docx")).success);

    assert_eq!(world.hosts_created(HostKind::Word), 2);
}

#[test]
fn test_unresponsive_session_is_recycled() {
    let _apartment = ApartmentGuard::enter();
    let world = FakeWorld::new();
    let config = fast_config();
    let mut pool = pool(&world, &config);
    let inputs = Inputs::new();

    assert!(pool.convert(&batch(&inputs, "a.docx")).success);
    let pid = pool.session(HostKind::Word).and_then(|s| s.pid()).unwrap();
    world.set_responding(pid, false);

    assert!(pool.convert(&batch(&inputs, "b.docx")).success);
    assert_eq!(world.hosts_created(HostKind::Word), 2);
    assert!(!world.is_alive(pid));
}

#[test]
fn test_health_check_can_be_disabled() {
    let _apartment = ApartmentGuard::enter();
    let world = FakeWorld::new();
    let mut config = fast_config();
    config.pool.health_check_on_acquire = false;
    let mut pool = pool(&world, &config);
    let inputs = Inputs::new();

    assert!(pool.convert(&batch(&inputs, "a.docx")).success);
    let pid = pool.session(HostKind::Word).and_then(|s| s.pid()).unwrap();
    world.set_responding(pid, false);

    assert!(pool.convert(&batch(&inputs, "b.docx")).success);
    assert_eq!(world.hosts_created(HostKind::Word), 1);
}

#[test]
fn test_failed_session_is_never_reused() {
    let _apartment = ApartmentGuard::enter();
    let world = FakeWorld::new();
    let config = fast_config();
    let mut pool = pool(&world, &config);
    let inputs = Inputs::new();

    assert!(pool.convert(&batch(&inputs, "a.docx")).success);
    world.fail_export("b.docx", Fault::Operation);

    let result = pool.convert(&batch(&inputs, "b.docx"));
    assert!(!result.success);
    assert_eq!(result.failure, Some(FailureCategory::HostOperation));
    assert_eq!(pool.state(HostKind::Word), SessionState::Absent);

    assert!(pool.convert(&batch(&inputs, "c.docx")).success);
    assert_eq!(world.hosts_created(HostKind::Word), 2);
    assert_eq!(pool.session(HostKind::Word).map(|s| s.generation()), Some(2));
}

#[test]
fn test_warm_up_creates_session_once() {
    let _apartment = ApartmentGuard::enter();
    let world = FakeWorld::new();
    let config = fast_config();
    let mut pool = pool(&world, &config);

    pool.warm_up(HostKind::Excel).unwrap();
    pool.warm_up(HostKind::Excel).unwrap();

    assert_eq!(world.hosts_created(HostKind::Excel), 1);
    assert_eq!(pool.state(HostKind::Excel), SessionState::Ready);
    assert_eq!(pool.state(HostKind::Word), SessionState::Absent);
}

// ============================================================================
// Failures and recovery
// ============================================================================

#[test]
fn test_crash_mid_batch_only_fails_that_file() {
    let _apartment = ApartmentGuard::enter();
    let world = FakeWorld::new();
    let config = fast_config();
    let mut pool = pool(&world, &config);
    let inputs = Inputs::new();
    world.fail_export("c.docx", Fault::Crash);

    let outcomes: Vec<bool> = ["a.docx", "b.docx", "c.docx", "d.docx", "e.docx"]
        .iter()
        .map(|name| pool.convert(&batch(&inputs, name)).success)
        .collect();

    assert_eq!(outcomes, vec![true, true, false, true, true]);
    assert_eq!(world.hosts_created(HostKind::Word), 2);
    assert!(!inputs.path("c.pdf").exists());
    assert!(inputs.path("d.pdf").exists());

    let recovery = pool.services().recovery.stats();
    assert_eq!(recovery.total_attempts, 1);
    assert_eq!(recovery.successful_attempts, 1);

    pool.finish_batch();
    assert_eq!(pool.services().ledger.outstanding(), 0);
}

#[test]
fn test_crash_reports_restart_guidance() {
    let _apartment = ApartmentGuard::enter();
    let world = FakeWorld::new();
    let config = fast_config();
    let mut pool = pool(&world, &config);
    let inputs = Inputs::new();
    world.fail_export("a.docx", Fault::Crash);

    let result = pool.convert(&ConversionRequest::beside_input(inputs.file("a.docx")));

    assert_eq!(result.failure, Some(FailureCategory::HostCrash));
    let report = result.report().expect("failure report");
    assert!(report.can_retry);
    assert_eq!(report.title, "Office application stopped");
}

#[test]
fn test_transient_interface_error_is_retried_once() {
    let _apartment = ApartmentGuard::enter();
    let world = FakeWorld::new();
    let config = fast_config();
    let mut pool = pool(&world, &config);
    let inputs = Inputs::new();
    world.fail_export("a.docx", Fault::Interface(InterfaceCode::SERVER_BUSY));

    let result = pool.convert(&ConversionRequest::beside_input(inputs.file("a.docx")));

    assert!(result.success, "{:?}", result.error_message);
    assert_eq!(pool.stats().retries, 1);
    assert_eq!(world.hosts_created(HostKind::Word), 2);
    assert_eq!(pool.services().recovery.stats().total_attempts, 1);
}

#[test]
fn test_retry_happens_at_most_once() {
    let _apartment = ApartmentGuard::enter();
    let world = FakeWorld::new();
    let config = fast_config();
    let mut pool = pool(&world, &config);
    let inputs = Inputs::new();
    for _ in 0..3 {
        world.fail_export("a.docx", Fault::Interface(InterfaceCode::CALL_REJECTED));
    }

    let result = pool.convert(&ConversionRequest::beside_input(inputs.file("a.docx")));

    assert!(!result.success);
    assert_eq!(result.failure, Some(FailureCategory::Interface));
    assert_eq!(pool.stats().retries, 1);
    assert_eq!(world.hosts_created(HostKind::Word), 2);
}

#[test]
fn test_non_transient_interface_error_is_not_retried() {
    let _apartment = ApartmentGuard::enter();
    let world = FakeWorld::new();
    let config = fast_config();
    let mut pool = pool(&world, &config);
    let inputs = Inputs::new();
    world.fail_export("a.docx", Fault::Interface(InterfaceCode(0x8002_0009)));

    let result = pool.convert(&ConversionRequest::beside_input(inputs.file("a.docx")));

    assert!(!result.success);
    assert_eq!(pool.stats().retries, 0);
    assert!(!result.report().unwrap().can_retry);
}

#[test]
fn test_locked_file_waits_and_retries_without_reaping() {
    let _apartment = ApartmentGuard::enter();
    let world = FakeWorld::new();
    let mut config = fast_config();
    config.recovery.lock_retry_delay = Duration::from_millis(20);
    let mut pool = pool(&world, &config);
    let inputs = Inputs::new();
    let input = inputs.file("report.docx");
    inputs.file("~$report.docx");

    let result = pool.convert(&ConversionRequest::beside_input(&input));

    assert!(!result.success);
    assert_eq!(result.failure, Some(FailureCategory::Validation));
    assert!(result.duration >= Duration::from_millis(40));
    let report = result.report().unwrap();
    assert_eq!(report.title, "File in use");
    assert!(report.can_retry);

    assert_eq!(pool.stats().retries, 1);
    let recovery = pool.services().recovery.stats();
    assert_eq!(recovery.total_attempts, 2);
    assert_eq!(recovery.successful_attempts, 2);
    assert_eq!(world.hosts_created(HostKind::Word), 0);
    assert!(world.kills().is_empty());
    assert!(world.close_requests().is_empty());
}

#[test]
fn test_invalid_inputs_never_reach_the_host() {
    let _apartment = ApartmentGuard::enter();
    let world = FakeWorld::new();
    let config = fast_config();
    let mut pool = pool(&world, &config);
    let inputs = Inputs::new();
    let empty = inputs.path("empty.docx");
    std::fs::write(&empty, b"").unwrap();

    for request in [
        ConversionRequest::beside_input(inputs.path("missing.docx")),
        ConversionRequest::beside_input(&empty),
        ConversionRequest::beside_input(inputs.file("notes.txt")),
    ] {
        let result = pool.convert(&request);
        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureCategory::Validation));
        assert!(!result.report().unwrap().can_retry);
    }

    assert_eq!(pool.stats().retries, 0);
    assert_eq!(world.hosts_created(HostKind::Word), 0);
}

#[test]
fn test_missing_office_suite_is_configuration_failure() {
    let _apartment = ApartmentGuard::enter();
    let world = FakeWorld::new();
    world.set_not_installed(true);
    let config = fast_config();
    let mut pool = pool(&world, &config);
    let inputs = Inputs::new();

    let result = pool.convert(&ConversionRequest::beside_input(inputs.file("a.docx")));

    assert!(!result.success);
    assert_eq!(result.failure, Some(FailureCategory::Configuration));
    assert_eq!(pool.state(HostKind::Word), SessionState::Absent);
    assert!(!result.report().unwrap().can_retry);
}

#[test]
fn test_failed_configure_quits_the_new_host() {
    let _apartment = ApartmentGuard::enter();
    let world = FakeWorld::new();
    world.fail_next_configure();
    let config = fast_config();
    let mut pool = pool(&world, &config);
    let inputs = Inputs::new();

    let result = pool.convert(&ConversionRequest::beside_input(inputs.file("a.docx")));

    assert!(!result.success);
    assert_eq!(result.failure, Some(FailureCategory::HostOperation));
    assert_eq!(world.quits().len(), 1);
    assert!(world.host_pids().is_empty());
    assert!(pool.services().registry.app_created(None).is_empty());
    assert_eq!(pool.state(HostKind::Word), SessionState::Absent);
    assert_eq!(pool.services().ledger.outstanding(), 0);
}

#[test]
fn test_pool_refuses_work_outside_apartment() {
    let world = FakeWorld::new();
    let config = fast_config();
    let mut pool = pool(&world, &config);
    let inputs = Inputs::new();

    let result = pool.convert(&ConversionRequest::beside_input(inputs.file("a.docx")));

    assert!(!result.success);
    assert_eq!(result.failure, Some(FailureCategory::Configuration));
    assert!(result.error_message.unwrap().contains("apartment"));
    assert_eq!(world.hosts_created(HostKind::Word), 0);
    assert!(pool.warm_up(HostKind::Word).is_err());
}

// ============================================================================
// Ownership
// ============================================================================

#[test]
fn test_user_instance_is_never_terminated() {
    let world = FakeWorld::new();
    let user_pid = world.spawn_user_process();
    let config = fast_config();

    let _apartment = ApartmentGuard::enter();
    let mut pool = pool(&world, &config);
    let inputs = Inputs::new();

    // The suite hands the new session the user's running instance.
    world.adopt_next(user_pid);
    let result = pool.convert(&ConversionRequest::beside_input(inputs.file("a.docx")));
    assert!(result.success, "{:?}", result.error_message);

    assert!(world.is_alive(user_pid));
    assert!(world.quits().is_empty());
    assert!(world.kills().is_empty());
    assert_eq!(
        pool.services().registry.origin_of(HostKind::Word, user_pid),
        Some(ProcessOrigin::UserOwned)
    );

    // Crash recovery terminates app-created hosts only.
    world.fail_export("b.docx", Fault::Crash);
    let result = pool.convert(&ConversionRequest::beside_input(inputs.file("b.docx")));
    assert_eq!(result.failure, Some(FailureCategory::HostCrash));
    assert!(world.is_alive(user_pid));
    assert!(!world.kills().contains(&user_pid));
    assert!(!world.close_requests().contains(&user_pid));
}

#[test]
fn test_app_created_process_is_registered_while_live() {
    let _apartment = ApartmentGuard::enter();
    let world = FakeWorld::new();
    let config = fast_config();
    let mut pool = pool(&world, &config);

    pool.warm_up(HostKind::Word).unwrap();
    let pid = pool.session(HostKind::Word).and_then(|s| s.pid()).unwrap();
    assert!(pool.services().registry.is_definitely_app_created(HostKind::Word, pid));
    assert!(pool.services().registry.is_in_use(pid));
    assert!(!pool.services().reaper.is_orphaned(pid));

    pool.shutdown();
    assert!(!pool.services().registry.is_definitely_app_created(HostKind::Word, pid));
    assert!(!pool.services().registry.is_in_use(pid));
    assert!(!world.is_alive(pid));
}

// ============================================================================
// Reference accounting
// ============================================================================

#[test]
fn test_every_reference_is_released_newest_first() {
    let _apartment = ApartmentGuard::enter();
    let world = FakeWorld::new();
    let config = fast_config();
    let mut pool = pool(&world, &config);
    let inputs = Inputs::new();

    assert!(pool.convert(&batch(&inputs, "a.docx")).success);
    let log = world.release_log();
    let types: Vec<ObjectType> = log.iter().map(|(_, t)| *t).collect();
    assert_eq!(types, vec![ObjectType::Document, ObjectType::Documents]);

    pool.finish_batch();
    let log = world.release_log();
    assert_eq!(log.last().map(|(_, t)| *t), Some(ObjectType::Application));

    let stats = pool.services().ledger.stats();
    assert_eq!(stats.created, 3);
    assert_eq!(stats.released, 3);
    assert_eq!(stats.outstanding, 0);
    assert_eq!(stats.release_failures, 0);
    assert_eq!(world.live_objects(), 0);
}

#[test]
fn test_references_released_when_export_fails() {
    let _apartment = ApartmentGuard::enter();
    let world = FakeWorld::new();
    let config = fast_config();
    let mut pool = pool(&world, &config);
    let inputs = Inputs::new();
    world.fail_export("a.docx", Fault::Operation);
    world.fail_export("b.xlsx", Fault::Crash);

    assert!(!pool.convert(&batch(&inputs, "a.docx")).success);
    assert!(!pool.convert(&batch(&inputs, "b.xlsx")).success);
    pool.finish_batch();

    assert_eq!(pool.services().ledger.outstanding(), 0);
    assert_eq!(world.live_objects(), 0);
}
