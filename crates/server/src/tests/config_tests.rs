use super::*;

use std::time::{SystemTime, UNIX_EPOCH};

fn env_from(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
    move |key: &str| {
        pairs
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.to_string())
    }
}

#[test]
fn normalizes_plain_file_path_to_sqlite_url() {
    assert_eq!(
        normalize_database_url("./data/test.db"),
        "sqlite://./data/test.db"
    );
    assert_eq!(normalize_database_url("  "), Settings::default().database_url);
    assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
}

#[test]
fn creates_parent_dir_for_sqlite_file() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();

    let temp_root = std::env::temp_dir().join(format!("delivery_server_test_{suffix}"));
    let db_path = temp_root.join("data").join("test.db");

    prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare db url");
    assert!(temp_root.join("data").exists());

    fs::remove_dir_all(temp_root).expect("cleanup");
}

#[test]
fn file_values_override_defaults() {
    let mut settings = Settings::default();
    apply_file(
        &mut settings,
        r#"
bind_addr = "0.0.0.0:8080"
depot_address = "Depot Rd, Ja-Ela"
request_timeout_seconds = 5
"#,
    );
    assert_eq!(settings.server_bind, "0.0.0.0:8080");
    assert_eq!(settings.depot_address, "Depot Rd, Ja-Ela");
    assert_eq!(settings.request_timeout_seconds, 5);
    assert_eq!(settings.database_url, Settings::default().database_url);
}

#[test]
fn unreadable_file_leaves_defaults() {
    let mut settings = Settings::default();
    apply_file(&mut settings, "bind_addr = [unterminated");
    assert_eq!(settings.server_bind, Settings::default().server_bind);
}

#[test]
fn prefixed_env_wins_over_bare_name() {
    let mut settings = Settings::default();
    apply_env(
        &mut settings,
        env_from(&[
            ("DATABASE_URL", "sqlite://bare.db"),
            ("APP__DATABASE_URL", "sqlite://prefixed.db"),
            ("SESSION_SECRET", "s3cret"),
            ("GOOGLE_MAPS_API_KEY", "maps-key"),
        ]),
    );
    assert_eq!(settings.database_url, "sqlite://prefixed.db");
    assert_eq!(settings.session_secret, "s3cret");
    assert!(!settings.uses_dev_session_secret());
    assert_eq!(settings.google_maps_api_key.as_deref(), Some("maps-key"));
}

#[test]
fn invalid_timeout_is_ignored() {
    let mut settings = Settings::default();
    apply_env(
        &mut settings,
        env_from(&[("APP__REQUEST_TIMEOUT_SECONDS", "0")]),
    );
    assert_eq!(settings.request_timeout_seconds, 30);

    apply_env(
        &mut settings,
        env_from(&[("APP__REQUEST_TIMEOUT_SECONDS", "12")]),
    );
    assert_eq!(settings.request_timeout_seconds, 12);
}

#[test]
fn non_positive_session_ttl_is_ignored() {
    let default_ttl = Settings::default().session_ttl_seconds;
    let mut settings = Settings::default();
    let rejected: [&'static [(&'static str, &'static str)]; 3] = [
        &[("APP__SESSION_TTL_SECONDS", "0")],
        &[("APP__SESSION_TTL_SECONDS", "-60")],
        &[("APP__SESSION_TTL_SECONDS", "soon")],
    ];
    for pairs in rejected {
        apply_env(&mut settings, env_from(pairs));
        assert_eq!(settings.session_ttl_seconds, default_ttl);
    }

    apply_file(&mut settings, "session_ttl_seconds = -5\nrequest_timeout_seconds = 0\n");
    assert_eq!(settings.session_ttl_seconds, default_ttl);
    assert_eq!(settings.request_timeout_seconds, 30);

    apply_env(
        &mut settings,
        env_from(&[("APP__SESSION_TTL_SECONDS", "900")]),
    );
    assert_eq!(settings.session_ttl_seconds, 900);
}
