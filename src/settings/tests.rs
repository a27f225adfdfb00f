use std::time::Duration;

use validator::Validate;

use super::{ReportSettings, Settings, TaskSettings};

#[test]
fn test_settings_new() {
    let settings = Settings::new("configs/config.toml").unwrap();
    assert_eq!(settings.api.bind_address.port(), 8081);
    assert_eq!(settings.task.stall_warning(), Duration::from_secs(60));
    assert_eq!(settings.task.deadline(), Some(Duration::from_secs(86400)));
    assert_eq!(settings.task.env.get("study").map(String::as_str), Some("example"));
    assert!(settings.hwe.midp);
    assert!(settings.report.command.is_none());

    assert!(Settings::new("").is_err());
}

#[test]
fn test_validate_task() {
    assert!(TaskSettings::default().validate().is_ok());
    assert!(TaskSettings {
        stall_warning: 0.,
        ..TaskSettings::default()
    }
    .validate()
    .is_err());
    assert!(TaskSettings {
        deadline: Some(-1.),
        ..TaskSettings::default()
    }
    .validate()
    .is_err());
    assert!(TaskSettings {
        deadline: Some(0.5),
        partial_completion: true,
        ..TaskSettings::default()
    }
    .validate()
    .is_ok());
}

#[test]
fn test_validate_report() {
    assert!(ReportSettings { command: None }.validate().is_ok());
    assert!(ReportSettings {
        command: Some(vec![])
    }
    .validate()
    .is_err());
    assert!(ReportSettings {
        command: Some(vec!["plot-qc".into()])
    }
    .validate()
    .is_ok());
}
