/// Integration tests for `mc-proxy` config loading.
///
/// Tests required-field validation, default values, and the
/// mutually-exclusive-auth-method check.
use mc_proxy::config::load_config_from_str;

#[test]
fn valid_minimal_config_loads_ok() {
    let toml = r#"
schema_version = 1

[server]
address = "play.example.com"

[auth]
username = "Player1"
"#;
    let cfg = load_config_from_str(toml).expect("should load");
    assert_eq!(cfg.schema_version, 1);
    assert_eq!(cfg.server.address, "play.example.com");
    assert_eq!(cfg.auth.username, "Player1");
    assert_eq!(cfg.proxy_port, 25565);
    assert_eq!(cfg.server.port, 25565);
    assert_eq!(cfg.command_prefix, "/p:");
    assert_eq!(cfg.modules.load, vec!["core".to_owned()]);
}

#[test]
fn missing_schema_version_fails() {
    let toml = r#"
[server]
address = "play.example.com"

[auth]
username = "Player1"
"#;
    let result = load_config_from_str(toml);
    assert!(result.is_err(), "missing schema_version must fail");
}

#[test]
fn wrong_schema_version_fails() {
    let toml = r#"
schema_version = 2

[server]
address = "play.example.com"

[auth]
username = "Player1"
"#;
    let result = load_config_from_str(toml);
    assert!(result.is_err(), "schema_version != 1 must fail");
}

#[test]
fn missing_server_address_fails() {
    let toml = r#"
schema_version = 1

[server]

[auth]
username = "Player1"
"#;
    let result = load_config_from_str(toml);
    assert!(result.is_err(), "missing server.address must fail");
}

#[test]
fn missing_auth_username_fails() {
    let toml = r#"
schema_version = 1

[server]
address = "play.example.com"

[auth]
"#;
    let result = load_config_from_str(toml);
    assert!(result.is_err(), "missing auth.username must fail");
}

#[test]
fn password_and_access_token_together_fails() {
    let toml = r#"
schema_version = 1

[server]
address = "play.example.com"

[auth]
username = "Player1"
password = "hunter2"
access_token = "abc"
"#;
    let result = load_config_from_str(toml);
    assert!(result.is_err(), "password + access_token must be rejected");
}

#[test]
fn custom_server_port_and_version_are_honored() {
    let toml = r#"
schema_version = 1
proxy_port = 26000
command_prefix = "#"

[server]
address = "play.example.com"
port = 25577
version = "1.20.1"
motd = "welcome"

[auth]
username = "Player1"
"#;
    let cfg = load_config_from_str(toml).expect("should load");
    assert_eq!(cfg.proxy_port, 26000);
    assert_eq!(cfg.command_prefix, "#");
    assert_eq!(cfg.server.port, 25577);
    assert_eq!(cfg.server.version, "1.20.1");
    assert_eq!(cfg.server.motd.as_deref(), Some("welcome"));
}

#[test]
fn modules_table_overrides_defaults() {
    let toml = r#"
schema_version = 1

[server]
address = "play.example.com"

[auth]
username = "Player1"

[modules]
dir = "./my-modules"
load = ["core", "extra"]

[modules.config]
extra = { greeting = "hi" }
"#;
    let cfg = load_config_from_str(toml).expect("should load");
    assert_eq!(cfg.modules.load, vec!["core".to_owned(), "extra".to_owned()]);
    assert!(cfg.modules.dir.ends_with("my-modules"));
    assert!(cfg.modules.config.contains_key("extra"));
}

#[test]
fn malformed_toml_fails() {
    let toml = "this is not valid toml {{{";
    let result = load_config_from_str(toml);
    assert!(result.is_err());
}
