use oams_config::load_toml;

const GOOD: &str = r#"
[manager]
reload_before_toolhead_distance = 10.0
clog_sensitivity = "high"
runout_pause_distance = 5.0

[feeder.ams0]
fps_upper_threshold = 0.65
fps_lower_threshold = 0.35
f1s_hes_on = [0.5, 0.5, 0.5, 0.5]
hub_hes_on = [0.5, 0.5, 0.5, 0.5]
ticks_per_mm = 40.0
load_retry_max = 3

[fps.fps0]
pin = "PA1"
extruder = "extruder"
feeders = ["ams0"]

[group.T0]
members = ["ams0-0", "ams0-1"]
"#;

#[test]
fn accepts_a_complete_config() {
    let cfg = load_toml(GOOD).expect("parse TOML");
    cfg.validate().expect("valid config should pass");
    assert_eq!(cfg.feeder["ams0"].load_retry_max, 3);
    assert_eq!(cfg.manager.runout_pause_distance, 5.0);
}

#[test]
fn rejects_inverted_pressure_thresholds() {
    let toml = GOOD.replace("fps_upper_threshold = 0.65", "fps_upper_threshold = 0.2");
    let cfg = load_toml(&toml).expect("parse TOML");
    let err = cfg.validate().expect_err("lower >= upper must be rejected");
    assert!(
        format!("{err}").contains("fps_lower_threshold must be below"),
        "unexpected message: {err}"
    );
}

#[test]
fn rejects_out_of_range_threshold() {
    let toml = GOOD.replace("fps_lower_threshold = 0.35", "fps_lower_threshold = 0.0");
    let cfg = load_toml(&toml).expect("parse TOML");
    let err = cfg.validate().expect_err("threshold of 0 must be rejected");
    assert!(format!("{err}").contains("inside (0, 1)"));
}

#[test]
fn rejects_zero_ticks_per_mm() {
    let toml = GOOD.replace("ticks_per_mm = 40.0", "ticks_per_mm = 0.0");
    let cfg = load_toml(&toml).expect("parse TOML");
    let err = cfg.validate().expect_err("ticks_per_mm=0 must be rejected");
    assert!(format!("{err}").contains("ticks_per_mm must be > 0"));
}

#[test]
fn rejects_unknown_feeder_reference() {
    let toml = GOOD.replace("feeders = [\"ams0\"]", "feeders = [\"ams9\"]");
    let cfg = load_toml(&toml).expect("parse TOML");
    let err = cfg.validate().expect_err("dangling feeder ref");
    assert!(format!("{err}").contains("unknown feeder 'ams9'"));
}

#[test]
fn rejects_bad_group_member_token() {
    let toml = GOOD.replace("\"ams0-1\"", "\"ams0-7\"");
    let cfg = load_toml(&toml).expect("parse TOML");
    let err = cfg.validate().expect_err("bay 7 is out of range");
    assert!(format!("{err}").contains("out of range"));
}

#[test]
fn rejects_empty_installation() {
    let cfg = load_toml("").expect("parse TOML");
    let err = cfg.validate().expect_err("no feeders");
    assert!(format!("{err}").contains("at least one"));
}

#[test]
fn manager_defaults_apply_when_section_is_missing() {
    let cfg = load_toml("[feeder.ams0]\n").expect("parse TOML");
    assert_eq!(cfg.manager.reload_before_toolhead_distance, 0.0);
    assert_eq!(cfg.manager.runout_pause_distance, 60.0);
    assert_eq!(cfg.manager.bowden_clear_grace_ms, 200);
    assert_eq!(
        cfg.manager.clog_sensitivity,
        oams_config::ClogSensitivity::Medium
    );
}

#[test]
fn logging_section_parses_with_rotation() {
    let toml = r#"
[feeder.ams0]

[logging]
file = "oams.log"
level = "debug"
rotation = "daily"
"#;
    let cfg = load_toml(toml).expect("parse TOML");
    cfg.validate().expect("valid config should pass");
    assert_eq!(cfg.logging.file.as_deref(), Some("oams.log"));
    assert_eq!(cfg.logging.level.as_deref(), Some("debug"));
    assert_eq!(cfg.logging.rotation.as_deref(), Some("daily"));

    let bare = load_toml("[feeder.ams0]\n").expect("parse TOML");
    assert!(bare.logging.file.is_none());
    assert!(bare.logging.rotation.is_none());
}

#[test]
fn unknown_sensitivity_is_a_parse_error() {
    let toml = GOOD.replace("\"high\"", "\"extreme\"");
    assert!(load_toml(&toml).is_err());
}
