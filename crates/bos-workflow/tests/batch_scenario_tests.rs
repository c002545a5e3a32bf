mod common;

use bos_core::plan::InstallPlan;
use bos_transport::{FakeResponse, FakeTransport};
use bos_workflow::{install, read_host_list, BatchRunner, HostOutcome};
use common::{factory_device, Fixture};
use std::fs;

fn two_host_batch(fixture: &Fixture) -> (Vec<String>, FakeTransport) {
    let list = fixture.path("hosts.csv");
    fs::write(&list, "host\n10.0.0.5\n10.0.0.6\n").unwrap();
    let hosts = read_host_list(&list).unwrap();
    let fake = FakeTransport::new()
        .with_device("10.0.0.5", factory_device())
        .with_device(
            "10.0.0.6",
            factory_device().on_command("stage1.sh", FakeResponse::fail(1, "Unsupported hardware")),
        );
    (hosts, fake)
}

fn plan() -> InstallPlan {
    InstallPlan {
        wait_for_reboot: false,
        ..InstallPlan::default()
    }
}

#[test]
fn ignore_mode_attempts_both_hosts_and_counts_one_error() {
    let fixture = Fixture::new();
    let (hosts, fake) = two_host_batch(&fixture);
    let env = fixture.env(&fake);
    let plan = plan();

    let report = BatchRunner::new(true, &fixture.cancel)
        .run(&hosts, |host| install(&env, host, &plan))
        .unwrap();

    assert_eq!(report.attempted(), vec!["10.0.0.5", "10.0.0.6"]);
    assert_eq!(report.error_count(), 1);
    assert_eq!(report.results[0].outcome, HostOutcome::Success);
    assert!(matches!(
        &report.results[1].outcome,
        HostOutcome::Failed { exit_code: 2, message, .. } if message.contains("Unsupported hardware")
    ));
    assert_eq!(fake.hosts_attempted(), vec!["10.0.0.5", "10.0.0.6"]);
    assert_eq!(fake.open_sessions(), 0);
}

#[test]
fn default_mode_aborts_at_the_failing_host() {
    let fixture = Fixture::new();
    let (mut hosts, fake) = two_host_batch(&fixture);
    // A host after the failing one must never be attempted.
    hosts.push("10.0.0.7".to_string());
    let fake = fake.with_device("10.0.0.7", factory_device());
    let env = fixture.env(&fake);
    let plan = plan();

    let abort = BatchRunner::new(false, &fixture.cancel)
        .run(&hosts, |host| install(&env, host, &plan))
        .unwrap_err();

    assert_eq!(abort.error.exit_code(), 2);
    assert_eq!(abort.report.attempted(), vec!["10.0.0.5", "10.0.0.6"]);
    assert_eq!(fake.hosts_attempted(), vec!["10.0.0.5", "10.0.0.6"]);
    assert!(fake.commands("10.0.0.7").is_empty());
}
