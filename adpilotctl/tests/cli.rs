use std::fs;

use clap::Parser;

use adpilotctl::{run, Cli};

fn cli(args: &[&str]) -> Cli {
    Cli::try_parse_from(args).unwrap()
}

#[test]
fn waste_analyze_writes_negatives_csv() {
    let dir = tempfile::tempdir().unwrap();
    let report = dir.path().join("terms.csv");
    fs::write(
        &report,
        "term,ad_group,campaign,impressions,clicks,cost,conversions\n\
         webp converter crash,webp-png,webp-shift-us,800,30,40.0,0\n\
         webp crack download,webp-png,webp-shift-us,500,20,25.0,0\n\
         webp to png,webp-png,webp-shift-us,400,30,18.0,4\n",
    )
    .unwrap();
    let negatives = dir.path().join("negatives.csv");

    run(cli(&[
        "adpilotctl",
        "--data-dir",
        dir.path().join("data").to_str().unwrap(),
        "--format",
        "json",
        "waste",
        "analyze",
        report.to_str().unwrap(),
        "--negatives-out",
        negatives.to_str().unwrap(),
    ]))
    .unwrap();

    let written = fs::read_to_string(&negatives).unwrap();
    assert!(written.starts_with("term,match_type,level"));
    assert!(written.contains("webp converter crash"));
    assert!(written.contains("crack"));
}

#[test]
fn approval_submit_blocks_over_cap_proposals() {
    let dir = tempfile::tempdir().unwrap();
    let changes = dir.path().join("changes.json");
    fs::write(
        &changes,
        r#"{
            "product": "webp-shift",
            "mutations": [{
                "mutation_type": "UPDATE_BUDGET",
                "campaign": "A",
                "current_value": 40.0,
                "proposed_value": 70.0
            }]
        }"#,
    )
    .unwrap();

    let err = run(cli(&[
        "adpilotctl",
        "--data-dir",
        dir.path().join("data").to_str().unwrap(),
        "approval",
        "submit",
        changes.to_str().unwrap(),
        "--by",
        "ops",
    ]))
    .unwrap_err();
    assert_eq!(err.kind(), "GuardrailViolation");
    assert!(err.to_record().contains("budget_cap"));
}

#[test]
fn approval_submit_and_vote_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("data");
    let changes = dir.path().join("changes.json");
    // A budget decrease clears every guardrail without collaborator data.
    fs::write(
        &changes,
        r#"{
            "product": "webp-shift",
            "mutations": [{
                "mutation_type": "UPDATE_BUDGET",
                "campaign": "A",
                "current_value": 40.0,
                "proposed_value": 35.0
            }]
        }"#,
    )
    .unwrap();

    run(cli(&[
        "adpilotctl",
        "--data-dir",
        data_dir.to_str().unwrap(),
        "--format",
        "json",
        "approval",
        "submit",
        changes.to_str().unwrap(),
        "--by",
        "ops",
    ]))
    .unwrap();

    // The guardrail audit and the pending request are both on disk.
    assert!(data_dir.join("guardrails.sqlite").exists());
    assert!(data_dir.join("approvals.sqlite").exists());

    run(cli(&[
        "adpilotctl",
        "--data-dir",
        data_dir.to_str().unwrap(),
        "--format",
        "json",
        "approval",
        "list",
        "--status",
        "PENDING",
    ]))
    .unwrap();
}

#[test]
fn unknown_status_filter_is_a_validation_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = run(cli(&[
        "adpilotctl",
        "--data-dir",
        dir.path().join("data").to_str().unwrap(),
        "experiment",
        "list",
        "--status",
        "bogus",
    ]))
    .unwrap_err();
    assert_eq!(err.kind(), "ValidationFailed");
}
