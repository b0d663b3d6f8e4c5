// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! End-to-end provisioning runs against a throwaway file tree.

use converge::{
    Logger, Manifest, RetryPolicy, RunContext, Runner, Selection, StepOutcome, Verbosity,
};

use pretty_assertions::assert_eq;
use std::{fs, path::Path, time::Duration};
use tempfile::tempdir;

fn apply(manifest: &Manifest, root: &Path) -> converge::RunReport {
    let logger = Logger::open(root.join("converge.log"), Verbosity::Silent);
    let ctx = RunContext {
        work_dir: root.to_path_buf(),
        env: Vec::new(),
        make_backups: true,
    };
    Runner::new(&logger, ctx)
        .with_network_retry(RetryPolicy::new(2, Duration::ZERO, Duration::ZERO))
        .run(&manifest.steps, &Selection::default())
        .unwrap()
}

fn backups_in(dir: &Path) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().contains(".bak."))
        .count()
}

#[test]
fn full_run_converges_and_repeat_is_a_no_op() {
    let root = tempdir().unwrap();
    let etc = root.path().join("etc");
    fs::create_dir(&etc).unwrap();
    fs::write(etc.join("sshd_config"), "Port 22\nPermitRootLogin yes\n").unwrap();
    fs::write(etc.join("motd"), "factory greeting\n").unwrap();

    let manifest: Manifest = format!(
        r#"
        [[step]]
        name = "harden-ssh"
        critical = true
        [step.action]
        kind = "ensure_line"
        path = "{etc}/sshd_config"
        key = "PermitRootLogin"
        value = "no"

        [[step]]
        name = "branding"
        depends_on = ["harden-ssh"]
        [step.action]
        kind = "write_file"
        path = "{etc}/motd"
        content = "managed by converge\n"

        [[step]]
        name = "record-run"
        depends_on = ["branding"]
        [step.action]
        kind = "command"
        program = "sh"
        args = ["-c", "date >> provisioned"]
        "#,
        etc = etc.display()
    )
    .parse()
    .unwrap();

    let report = apply(&manifest, root.path());
    assert!(report.full_success());

    let sshd_after_first = fs::read_to_string(etc.join("sshd_config")).unwrap();
    assert_eq!(sshd_after_first, "Port 22\nPermitRootLogin no\n");
    assert_eq!(
        fs::read_to_string(etc.join("motd")).unwrap(),
        "managed by converge\n"
    );
    // First run overwrote the factory motd, so exactly one backup exists.
    assert_eq!(backups_in(&etc), 1);

    let report = apply(&manifest, root.path());
    assert!(report.full_success());

    // Idempotence: config files byte-identical, no fresh backup churn.
    assert_eq!(
        fs::read_to_string(etc.join("sshd_config")).unwrap(),
        sshd_after_first
    );
    assert_eq!(backups_in(&etc), 1);

    // The command step is not idempotent by nature and ran both times.
    let runs = fs::read_to_string(root.path().join("provisioned")).unwrap();
    assert_eq!(runs.lines().count(), 2);
}

#[test]
fn fatal_step_leaves_partial_configuration_in_place() {
    let root = tempdir().unwrap();

    let manifest: Manifest = r#"
        [[step]]
        name = "first-write"
        [step.action]
        kind = "command"
        program = "sh"
        args = ["-c", "echo done > first"]

        [[step]]
        name = "broken"
        critical = true
        depends_on = ["first-write"]
        [step.action]
        kind = "command"
        program = "false"

        [[step]]
        name = "never-reached"
        depends_on = ["broken"]
        [step.action]
        kind = "command"
        program = "sh"
        args = ["-c", "echo done > second"]
    "#
    .parse()
    .unwrap();

    let report = apply(&manifest, root.path());

    assert!(!report.full_success());
    assert!(matches!(
        report.outcomes.last().unwrap(),
        (name, StepOutcome::FatalFailure(_)) if name == "broken"
    ));
    assert_eq!(report.skipped, vec!["never-reached"]);

    // No rollback: work already applied stays applied.
    assert!(root.path().join("first").exists());
    assert!(!root.path().join("second").exists());
}
