use hldtools::cfg::{BoardDecl, ProcSettings, Run, RunLimit};
use hldtools::frontend::BoardKind;

#[test]
fn serde_roundtrip() {
    let config = Run {
        name: String::from("test_settings_serde"),
        timestamp: None,
        limit: Some(RunLimit::EventLimit(5000)),
        save_events: None,
        merge_margin: Some(2e-9),
        events_built: None,
        boards: vec![
            BoardDecl {
                board: 1,
                kind: BoardKind::Generic,
                subsystem: None,
                channel_mask: None,
                settings: ProcSettings::default(),
            },
            BoardDecl {
                board: 2,
                kind: BoardKind::Trb,
                subsystem: Some(0x301),
                channel_mask: None,
                settings: ProcSettings {
                    bufs_queue_capacity: 10000,
                    ..Default::default()
                },
            },
        ],
    };
    let ser = serde_json::to_string(&config).unwrap();
    let de: Run = serde_json::from_str(&ser).unwrap();
    assert_eq!(config, de);
}

#[test]
fn de_simple() {
    let x = r#"{
        "name": "bench",
        "timestamp": null,
        "limit": null,
        "save_events": null,
        "merge_margin": null,
        "events_built": null,
        "boards": [
            {"board": 1, "kind": "generic", "subsystem": null, "channel_mask": null},
            {"board": 2, "kind": "tdc", "subsystem": null, "channel_mask": 15}
        ]
    }"#;
    let de: Run = serde_json::from_str(x).unwrap();
    assert_eq!(de.name, "bench");
    assert_eq!(de.boards.len(), 2);
    assert_eq!(de.boards[1].kind, BoardKind::Tdc);
    assert_eq!(de.boards[1].channel_mask, Some(15));
    // Omitted settings take the construction-time defaults
    assert_eq!(de.boards[0].settings, ProcSettings::default());
}

#[test]
fn de_duration_limit() {
    let x = r#"{
        "name": "timed",
        "timestamp": null,
        "limit": {"Duration": "5 sec"},
        "save_events": "events.tsv",
        "merge_margin": null,
        "events_built": null,
        "boards": []
    }"#;
    let de: Run = serde_json::from_str(x).unwrap();
    assert_eq!(
        de.limit,
        Some(RunLimit::Duration(
            "5 sec".parse::<humantime::Duration>().unwrap().into()
        ))
    );
    assert!(de.save_events.is_some());
}
