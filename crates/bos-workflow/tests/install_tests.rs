mod common;

use bos_core::plan::{BackupRequest, InstallPlan, PowerLimit};
use bos_error::{StopKind, StopPhase};
use bos_transport::{FakeDevice, FakeResponse, FakeTransport, Operation};
use bos_workflow::install;
use common::{factory_device, persistent_paths, Fixture};
use std::fs;

const HOST: &str = "10.0.0.5";

fn stage1_commands(fake: &FakeTransport) -> Vec<String> {
    fake.commands(HOST)
        .into_iter()
        .filter(|c| c.contains("stage1.sh"))
        .collect()
}

#[test]
fn install_stages_reboots_and_waits_for_the_web_port() {
    let fixture = Fixture::new();
    let fake = FakeTransport::new().with_device(
        HOST,
        factory_device().on_command("/sbin/reboot", FakeResponse::DropConnection),
    );
    let plan = InstallPlan {
        pool_user: Some("alice".into()),
        power_limit: PowerLimit::Watts(1200),
        ..InstallPlan::default()
    };

    install(&fixture.env(&fake), HOST, &plan).unwrap();

    assert!(fake.uploads(HOST).contains(&"/tmp/firmware/stage1.sh".to_string()));
    assert!(fake.has_path(HOST, "/usr/sbin/fw_printenv"));
    let stage1 = stage1_commands(&fake);
    assert_eq!(stage1.len(), 1);
    assert!(stage1[0].starts_with("cd /tmp/firmware && ls -l && /bin/sh stage1.sh "));
    assert!(stage1[0].ends_with(" alice 1200 yes cond yes no"), "{}", stage1[0]);
    assert!(fake.ran(HOST, "/sbin/reboot"));
    assert!(fake.operations().contains(&Operation::WaitForPort {
        host: HOST.into(),
        port: 80
    }));
    assert_eq!(fake.open_sessions(), 0);
}

#[test]
fn device_already_on_target_firmware_is_refused() {
    let fixture = Fixture::new();
    let fake = FakeTransport::new().with_device(HOST, common::bos_device());

    let err = install(&fixture.env(&fake), HOST, &InstallPlan::default()).unwrap_err();

    assert_eq!(err.phase(), Some(StopPhase::Upgrade));
    assert_eq!(err.kind(), Some(StopKind::Prerequisite));
    assert!(err.to_string().contains("am2-s17"));
    assert!(fake.uploads(HOST).is_empty());
    assert_eq!(fake.open_sessions(), 0);
}

#[test]
fn failing_install_script_cleans_up_and_never_reboots() {
    let fixture = Fixture::new();
    let fake = FakeTransport::new().with_device(
        HOST,
        factory_device().on_command("stage1.sh", FakeResponse::fail(1, "NAND write failed\n")),
    );
    let pristine = {
        let probe = FakeTransport::new().with_device(HOST, factory_device());
        persistent_paths(&probe, HOST)
    };

    let err = install(&fixture.env(&fake), HOST, &InstallPlan::default()).unwrap_err();

    assert_eq!(err.exit_code(), 2);
    assert_eq!(err.kind(), Some(StopKind::StageFailure));
    assert!(err.to_string().contains("NAND write failed"));
    assert!(!fake.ran(HOST, "/sbin/reboot"));
    assert_eq!(persistent_paths(&fake, HOST), pristine);
    assert_eq!(fake.open_sessions(), 0);
}

#[test]
fn dry_run_twice_leaves_no_persistent_trace() {
    let fixture = Fixture::new();
    let fake = FakeTransport::new().with_device(HOST, factory_device());
    let before = persistent_paths(&fake, HOST);
    let plan = InstallPlan {
        dry_run: true,
        ..InstallPlan::default()
    };

    install(&fixture.env(&fake), HOST, &plan).unwrap();
    install(&fixture.env(&fake), HOST, &plan).unwrap();

    assert_eq!(persistent_paths(&fake, HOST), before);
    assert!(!fake.ran(HOST, "reboot"));
    assert!(!fake
        .operations()
        .iter()
        .any(|op| matches!(op, Operation::WaitForPort { .. })));
    let stage1 = stage1_commands(&fake);
    assert_eq!(stage1.len(), 2);
    assert!(stage1.iter().all(|c| c.ends_with(" yes cond yes yes")));
    // A fresh hardware id per installation.
    assert_ne!(stage1[0], stage1[1]);
}

#[test]
fn requested_backup_is_committed_before_staging() {
    let fixture = Fixture::new();
    let fake = FakeTransport::new().with_device(
        HOST,
        factory_device()
            .on_command(
                "fw_printenv",
                FakeResponse::stdout("mtdparts=mtdparts=pl35x-nand:8m(boot),8m(configs)\n"),
            )
            .on_command("tar czf - /config", FakeResponse::stdout("CONFIG"))
            .on_command("nanddump", FakeResponse::stdout("DUMP")),
    );
    let plan = InstallPlan {
        backup: Some(BackupRequest { storage_dump: true }),
        wait_for_reboot: false,
        ..InstallPlan::default()
    };

    install(&fixture.env(&fake), HOST, &plan).unwrap();

    let backups: Vec<_> = fs::read_dir(fixture.path("backup"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(backups.len(), 1);
    let name = backups[0].file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("001a2b3c4d5e-"), "{}", name);
    assert!(backups[0].join("boot.bin").is_file());
    assert!(backups[0].join("configs.bin").is_file());

    let commands = fake.commands(HOST);
    let backup_at = commands.iter().position(|c| c.contains("nanddump")).unwrap();
    let stage1_at = commands.iter().position(|c| c.contains("stage1.sh")).unwrap();
    assert!(backup_at < stage1_at);
    assert!(!fake
        .operations()
        .iter()
        .any(|op| matches!(op, Operation::WaitForPort { .. })));
}

#[test]
fn failed_backup_stops_before_the_device_is_touched() {
    let fixture = Fixture::new();
    let fake = FakeTransport::new().with_device(
        HOST,
        factory_device()
            .on_command("fw_printenv", FakeResponse::stdout("mtdparts=nand:8m(a)\n"))
            .on_command("tar czf", FakeResponse::fail(2, "tar: /config: No such file")),
    );
    let plan = InstallPlan {
        backup: Some(BackupRequest {
            storage_dump: false,
        }),
        ..InstallPlan::default()
    };

    let err = install(&fixture.env(&fake), HOST, &plan).unwrap_err();

    assert_eq!(err.kind(), Some(StopKind::BackupFailed));
    assert!(fake.uploads(HOST).is_empty());
    let leftovers = fs::read_dir(fixture.path("backup"))
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0);
}

#[test]
fn invalid_post_upgrade_directory_is_rejected_before_connecting() {
    let fixture = Fixture::new();
    let fake = FakeTransport::new().with_device(HOST, factory_device());
    let plan = InstallPlan {
        post_upgrade: Some(fixture.path("no-such-dir")),
        ..InstallPlan::default()
    };

    let err = install(&fixture.env(&fake), HOST, &plan).unwrap_err();

    assert_eq!(err.exit_code(), 2);
    assert!(fake.hosts_attempted().is_empty());
}

#[test]
fn post_upgrade_payload_is_uploaded() {
    let fixture = Fixture::new();
    let user = fixture.path("my-stage3");
    fs::create_dir_all(&user).unwrap();
    fs::write(user.join("stage3.sh"), "echo hi\n").unwrap();
    let fake = FakeTransport::new().with_device(HOST, factory_device());
    let plan = InstallPlan {
        post_upgrade: Some(user),
        wait_for_reboot: false,
        ..InstallPlan::default()
    };

    install(&fixture.env(&fake), HOST, &plan).unwrap();

    assert!(fake.uploads(HOST).contains(&"/tmp/firmware/stage3.tgz".to_string()));
}

#[test]
fn device_that_never_comes_back_is_an_upgrade_stop() {
    let fixture = Fixture::new();
    let fake = FakeTransport::new().with_device(HOST, factory_device().never_returns());

    let err = install(&fixture.env(&fake), HOST, &InstallPlan::default()).unwrap_err();

    assert_eq!(err.exit_code(), 2);
    assert_eq!(err.phase(), Some(StopPhase::Upgrade));
    assert_eq!(err.kind(), Some(StopKind::StageFailure));
    assert!(fake.ran(HOST, "/sbin/reboot"));
}

#[test]
fn interrupt_before_start_touches_nothing() {
    let fixture = Fixture::new();
    fixture.cancel.cancel();
    let fake = FakeTransport::new().with_device(HOST, FakeDevice::new());

    let err = install(&fixture.env(&fake), HOST, &InstallPlan::default()).unwrap_err();

    assert!(err.is_interrupt());
    assert!(fake.hosts_attempted().is_empty());
}
