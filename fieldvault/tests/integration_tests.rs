//! Integration tests for fieldvault against an in-memory engine.

mod support;

use fieldvault::config::FieldConfig;
use fieldvault::error::Error;
use fieldvault::lifecycle::EncryptedModel;
use fieldvault::migration::Migrator;
use fieldvault::provider::SearchPlan;
use fieldvault::redact::SqlLogFilter;
use fieldvault::settings::Settings;
use fieldvault::storage::{ColumnKind, Storage};
use std::io::Write;
use std::sync::Arc;
use support::{armored, FakeEngine, MemorySink};
use tempfile::Builder;

const TABLE: &str = "sensitive_data";

fn engine() -> Arc<FakeEngine> {
    let engine = FakeEngine::new();
    engine.column(TABLE, "storage", ColumnKind::Text);
    engine.column(TABLE, "notes", ColumnKind::Binary);
    engine
}

fn model(engine: &Arc<FakeEngine>, provider: &str, options: &[(&str, &str)]) -> EncryptedModel {
    model_with_settings(engine, provider, options, Settings::shared())
}

fn model_with_settings(
    engine: &Arc<FakeEngine>,
    provider: &str,
    options: &[(&str, &str)],
    settings: Arc<Settings>,
) -> EncryptedModel {
    options
        .iter()
        .fold(EncryptedModel::builder(TABLE, provider), |builder, (name, value)| {
            builder.option(*name, *value)
        })
        .field("storage")
        .storage(Arc::clone(engine) as Arc<dyn Storage>)
        .settings(settings)
        .build()
        .expect("Failed to build model")
}

fn store(engine: &FakeEngine, model: &EncryptedModel, value: Option<&str>) -> i64 {
    let mut record = model.new_record();
    record.set_field("storage", value).expect("Failed to set field");
    engine.save(model, &mut record).expect("Failed to save record")
}

fn load(engine: &FakeEngine, model: &EncryptedModel, id: i64) -> Option<String> {
    let record = model.load(&engine.row(TABLE, id, &["storage"])).expect("Failed to load record");
    record.get_field("storage").expect("Failed to read field").map(str::to_string)
}

fn every_provider() -> Vec<(&'static str, Vec<(&'static str, String)>)> {
    vec![
        ("aes", vec![("key", "app-secret".into()), ("salt", "pepper".into()), ("iterations", "1000".into())]),
        ("aes", vec![("key", "app-secret".into()), ("kdf", "sha256".into())]),
        ("postgres_pgp", vec![("key", "pgp-secret".into())]),
        ("mysql_aes", vec![("key", "mysql-secret".into())]),
        ("mysql_aes", vec![("key", "mysql-secret".into()), ("salt", "pepper".into()), ("iterations", "1000".into())]),
        ("postgres_raw", vec![("key", "raw-secret".into())]),
        ("postgres_raw", vec![("key", "raw-secret".into()), ("iv", "0123456789abcdef".into())]),
        (
            "postgres_pgp_pub_key",
            vec![("public_key", armored("PUBLIC", "alice")), ("private_key", armored("PRIVATE", "alice"))],
        ),
        ("plaintext", vec![]),
    ]
}

#[test]
fn test_roundtrip_with_every_provider() {
    for (provider, options) in every_provider() {
        let engine = engine();
        let options: Vec<(&str, &str)> = options.iter().map(|(n, v)| (*n, v.as_str())).collect();
        let model = model(&engine, provider, &options);

        let id = store(&engine, &model, Some("4111 1111 1111 1111"));
        let raw = engine.raw(TABLE, id, "storage").expect("Missing stored value");
        if provider != "plaintext" {
            assert_ne!(raw, "4111 1111 1111 1111", "{provider} stored plaintext");
        }

        assert_eq!(load(&engine, &model, id).as_deref(), Some("4111 1111 1111 1111"), "{provider}");
    }
}

#[test]
fn test_null_and_blank_values_are_stored_as_is() {
    for (provider, options) in every_provider() {
        let engine = engine();
        let options: Vec<(&str, &str)> = options.iter().map(|(n, v)| (*n, v.as_str())).collect();
        let model = model(&engine, provider, &options);

        let null = store(&engine, &model, None);
        let blank = store(&engine, &model, Some(""));

        assert_eq!(engine.raw(TABLE, null, "storage"), None, "{provider}");
        assert_eq!(engine.raw(TABLE, blank, "storage").as_deref(), Some(""), "{provider}");
        assert_eq!(load(&engine, &model, blank).as_deref(), Some(""), "{provider}");
    }
}

#[test]
fn test_strict_mode_rejects_blank_and_writes_nothing() {
    let engine = engine();
    let model = model(&engine, "postgres_pgp", &[("key", "k"), ("strict_mode", "true")]);

    let mut record = model.new_record();
    record.set_field("storage", Some("")).unwrap();
    let statements = engine.statements();

    let result = engine.save(&model, &mut record);

    assert!(matches!(result, Err(Error::InvalidArgument(_))));
    assert_eq!(engine.statements(), statements);
    assert_eq!(record.id(), None);
}

#[test]
fn test_unchanged_record_resaves_identical_ciphertext() {
    let engine = engine();
    let model = model(&engine, "postgres_pgp", &[("key", "pgp-secret")]);
    let id = store(&engine, &model, Some("alice@example.com"));
    let before = engine.raw(TABLE, id, "storage");

    let mut record = model.load(&engine.row(TABLE, id, &["storage"])).unwrap();
    // Reading and re-assigning the same value is not a change
    assert_eq!(record.get_field("storage").unwrap(), Some("alice@example.com"));
    record.set_field("storage", Some("alice@example.com")).unwrap();
    assert!(!record.is_changed("storage").unwrap());

    let statements = engine.statements();
    engine.save(&model, &mut record).unwrap();

    assert_eq!(engine.raw(TABLE, id, "storage"), before);
    assert_eq!(engine.statements(), statements);
}

#[test]
fn test_changed_value_is_encrypted_again() {
    let engine = engine();
    let model = model(&engine, "postgres_pgp", &[("key", "pgp-secret")]);
    let id = store(&engine, &model, Some("old"));
    let before = engine.raw(TABLE, id, "storage");

    let mut record = model.load(&engine.row(TABLE, id, &["storage"])).unwrap();
    record.set_field("storage", Some("new")).unwrap();
    assert_eq!(record.changed_fields(), vec!["storage"]);
    engine.save(&model, &mut record).unwrap();

    assert_ne!(engine.raw(TABLE, id, "storage"), before);
    assert_eq!(load(&engine, &model, id).as_deref(), Some("new"));
    assert!(!record.is_changed("storage").unwrap());
    assert_eq!(record.cached_raw("storage").flatten(), engine.raw(TABLE, id, "storage").as_deref());
}

#[test]
fn test_lazy_load_does_not_touch_the_engine() {
    let engine = engine();
    let model = model(&engine, "postgres_pgp", &[("key", "pgp-secret")]);
    let id = store(&engine, &model, Some("value"));

    let statements = engine.statements();
    let record = model.load(&engine.row(TABLE, id, &["storage"])).unwrap();
    let lazy = record.lazy_field("storage").unwrap().expect("Expected lazy value");
    assert!(!lazy.is_realized());
    assert_eq!(engine.statements(), statements);

    assert!(*lazy == "value");
    // Key probe plus decryption, once
    assert_eq!(engine.statements(), statements + 2);
    assert_eq!(lazy.to_string(), "value");
    assert_eq!(engine.statements(), statements + 2);
}

#[test]
fn test_eager_load_decrypts_immediately() {
    let engine = engine();
    let settings = Settings::shared();
    let config = FieldConfig::new("mysql_aes", ["storage"]).with_option("key", "k").eager();
    let model =
        EncryptedModel::from_config(TABLE, &config, Some(engine.clone() as Arc<dyn Storage>), settings).unwrap();
    let id = store(&engine, &model, Some("value"));

    let record = model.load(&engine.row(TABLE, id, &["storage"])).unwrap();
    assert!(record.lazy_field("storage").unwrap().is_none());
    assert_eq!(record.get_field("storage").unwrap(), Some("value"));
}

#[test]
fn test_absent_column_is_neither_decrypted_nor_written() {
    let engine = engine();
    let model = model(&engine, "postgres_pgp", &[("key", "pgp-secret")]);
    let id = store(&engine, &model, Some("value"));
    let before = engine.raw(TABLE, id, "storage");

    let mut record = model.load(&engine.row(TABLE, id, &[])).unwrap();
    assert_eq!(record.get_field("storage").unwrap(), None);
    engine.save(&model, &mut record).unwrap();

    assert_eq!(engine.raw(TABLE, id, "storage"), before);
}

#[test]
fn test_wrong_key_error_is_redacted() {
    let engine = engine();
    let writer = model(&engine, "postgres_pgp", &[("key", "first-secret-key")]);
    let reader = model(&engine, "postgres_pgp", &[("key", "second-secret-key")]);
    let id = store(&engine, &writer, Some("value"));

    let record = reader.load(&engine.row(TABLE, id, &["storage"])).unwrap();
    let err = record.get_field("storage").unwrap_err();
    let message = err.to_string();

    assert!(err.is_decryption());
    assert!(message.contains("pgp_sym_decrypt([FILTERED])"), "{message}");
    assert!(!message.contains("second-secret-key"), "{message}");
    assert_eq!(
        reader.load(&engine.row(TABLE, id, &["storage"])).unwrap().lazy_field("storage").unwrap().unwrap().to_string(),
        "[UNDECRYPTABLE]"
    );
}

#[test]
fn test_fallback_key_decrypts_old_values() {
    let engine = engine();
    let old = model(&engine, "postgres_raw", &[("key", "old-key")]);
    let rotated = model(&engine, "postgres_raw", &[("key", "new-key"), ("fallback_key", "old-key")]);
    let id = store(&engine, &old, Some("legacy"));

    assert_eq!(load(&engine, &rotated, id).as_deref(), Some("legacy"));

    // New writes use the primary key only
    let fresh = store(&engine, &rotated, Some("fresh"));
    assert!(matches!(
        old.load(&engine.row(TABLE, fresh, &["storage"])).unwrap().get_field("storage"),
        Err(Error::DecryptionFailed(_))
    ));
}

#[test]
fn test_mysql_wrong_key_fails() {
    let engine = engine();
    let writer = model(&engine, "mysql_aes", &[("key", "one")]);
    let reader = model(&engine, "mysql_aes", &[("key", "two")]);
    let id = store(&engine, &writer, Some("value"));

    let record = reader.load(&engine.row(TABLE, id, &["storage"])).unwrap();
    assert!(record.get_field("storage").unwrap_err().is_decryption());
}

#[test]
fn test_statement_log_is_redacted() {
    let engine = engine();
    let settings = Settings::shared();
    let model = model_with_settings(&engine, "postgres_pgp", &[("key", "log-secret")], Arc::clone(&settings));

    let sink = Arc::new(MemorySink::default());
    let mut filter = SqlLogFilter::with_sink(Arc::clone(&settings), sink.clone());
    filter.register_provider(model.provider().as_ref());
    engine.log_to(Arc::new(filter));

    let id = store(&engine, &model, Some("card number"));
    assert_eq!(load(&engine, &model, id).as_deref(), Some("card number"));

    let lines = sink.lines();
    assert!(lines.iter().any(|l| l == "SELECT pgp_sym_encrypt([FILTERED])"), "{lines:?}");
    assert!(lines.iter().any(|l| l == "SELECT pgp_key_id([FILTERED])"), "{lines:?}");
    assert!(lines.iter().any(|l| l == "SELECT pgp_sym_decrypt([FILTERED])"), "{lines:?}");
    assert!(lines.iter().all(|l| !l.contains("log-secret") && !l.contains("card number")), "{lines:?}");
}

#[test]
fn test_silenced_log_drops_crypto_statements() {
    let engine = engine();
    let settings = Settings::shared();
    settings.set_silence_logs(true);
    let model = model_with_settings(&engine, "mysql_aes", &[("key", "log-secret")], Arc::clone(&settings));

    let sink = Arc::new(MemorySink::default());
    let mut filter = SqlLogFilter::with_sink(Arc::clone(&settings), sink.clone());
    filter.register_provider(model.provider().as_ref());
    engine.log_to(Arc::new(filter));

    store(&engine, &model, Some("value"));
    assert!(sink.lines().is_empty());

    settings.set_silence_logs(false);
    store(&engine, &model, Some("value"));
    assert_eq!(sink.lines(), vec!["SELECT AES_ENCRYPT([FILTERED])".to_string()]);
}

#[test]
fn test_public_key_pass_through() {
    let engine = engine();
    let public = armored("PUBLIC", "ops");
    let private = armored("PRIVATE", "ops");
    let writer = model(&engine, "postgres_pgp_pub_key", &[("public_key", public.as_str())]);
    let reader = model(
        &engine,
        "postgres_pgp_pub_key",
        &[("public_key", public.as_str()), ("private_key", private.as_str())],
    );

    let id = store(&engine, &writer, Some("salary"));
    let raw = engine.raw(TABLE, id, "storage").unwrap();

    // The writer sees ciphertext and re-saving leaves it untouched
    let mut record = writer.load(&engine.row(TABLE, id, &["storage"])).unwrap();
    assert_eq!(record.get_field("storage").unwrap(), Some(raw.as_str()));
    record.set_field("storage", Some(raw.clone())).unwrap();
    engine.save(&writer, &mut record).unwrap();
    assert_eq!(engine.raw(TABLE, id, "storage").as_deref(), Some(raw.as_str()));

    // Copying ciphertext into a new record does not wrap it again
    let copy = store(&engine, &writer, Some(raw.as_str()));
    assert_eq!(engine.raw(TABLE, copy, "storage").as_deref(), Some(raw.as_str()));

    assert_eq!(load(&engine, &reader, id).as_deref(), Some("salary"));
    assert!(matches!(writer.search_by_plaintext("storage", "salary"), Err(Error::UnsupportedSearch(_))));
}

#[test]
fn test_stub_encryption_toggle() {
    let engine = engine();
    let settings = Settings::shared();
    let model = model_with_settings(&engine, "postgres_pgp", &[("key", "k")], Arc::clone(&settings));

    settings.set_stub_encryption(true);
    let stubbed = store(&engine, &model, Some("visible"));
    assert_eq!(engine.raw(TABLE, stubbed, "storage").as_deref(), Some("visible"));

    settings.set_stub_encryption(false);
    let encrypted = store(&engine, &model, Some("hidden"));
    assert_ne!(engine.raw(TABLE, encrypted, "storage").as_deref(), Some("hidden"));
    assert_eq!(load(&engine, &model, encrypted).as_deref(), Some("hidden"));
}

#[test]
fn test_bounded_and_missing_columns_are_rejected() {
    let engine = engine();
    engine.column(TABLE, "storage", ColumnKind::BoundedText(255));
    let aes_model = model(&engine, "aes", &[("key", "k"), ("kdf", "sha256")]);

    let mut record = aes_model.new_record();
    record.set_field("storage", Some("value")).unwrap();
    let err = engine.save(&aes_model, &mut record).unwrap_err();
    assert_eq!(
        err,
        Error::Configuration(
            "Column :storage must be of type 'text' or 'binary' to be used for encryption, found varchar(255)"
                .to_string()
        )
    );

    let other = FakeEngine::new();
    let missing = model(&other, "aes", &[("key", "k"), ("kdf", "sha256")]);
    assert!(matches!(missing.validate_columns(&*other), Err(Error::Configuration(_))));
}

#[test]
fn test_search_predicates() {
    let engine = engine();
    let mysql = model(&engine, "mysql_aes", &[("key", "k")]);
    let id = store(&engine, &mysql, Some("needle"));

    match mysql.search_by_plaintext("storage", "needle").unwrap() {
        SearchPlan::Predicate { sql, binds } => {
            assert_eq!(sql, "`storage` = ?");
            let raw = engine.raw(TABLE, id, "storage").unwrap();
            assert_eq!(binds[0].as_bind(), fieldvault::storage::Bind::Text(&raw));
        }
        SearchPlan::ClientSide { .. } => panic!("Expected a predicate"),
    }

    let local = model(&engine, "aes", &[("key", "k"), ("kdf", "sha256")]);
    let plan = local.search_by_plaintext("storage", "needle").unwrap();
    assert!(plan.matches("needle"));
    assert!(!plan.matches("haystack"));
}

#[test]
fn test_migration_encrypts_and_decrypts_table() {
    let engine = engine();
    let model = model(&engine, "postgres_pgp", &[("key", "migrate")]);
    let plain = ["alice", "bob", "", "dave", "eve"];
    let mut ids: Vec<i64> = plain.iter().map(|v| engine.insert(TABLE, &[("storage", Some(*v))])).collect();
    ids.push(engine.insert(TABLE, &[("storage", None)]));

    let report = Migrator::new(&model).with_batch_size(2).encrypt_table(&*engine).unwrap();
    assert_eq!(report.batches, 3);
    assert_eq!(report.rows, 6);
    assert_eq!(report.transformed, 4);

    for (id, value) in ids.iter().zip(plain) {
        let raw = engine.raw(TABLE, *id, "storage").unwrap();
        if value.is_empty() {
            assert_eq!(raw, "");
        } else {
            assert!(raw.starts_with("\\x"));
            assert_eq!(load(&engine, &model, *id).as_deref(), Some(value));
        }
    }
    assert_eq!(engine.raw(TABLE, ids[5], "storage"), None);

    // Re-running leaves ciphertext alone
    let snapshot: Vec<_> = ids.iter().map(|id| engine.raw(TABLE, *id, "storage")).collect();
    let rerun = Migrator::new(&model).encrypt_table(&*engine).unwrap();
    assert_eq!(rerun.transformed, 0);
    assert_eq!(rerun.skipped, 4);
    assert_eq!(ids.iter().map(|id| engine.raw(TABLE, *id, "storage")).collect::<Vec<_>>(), snapshot);

    let back = Migrator::new(&model).decrypt_table(&*engine).unwrap();
    assert_eq!(back.transformed, 4);
    for (id, value) in ids.iter().zip(plain) {
        assert_eq!(engine.raw(TABLE, *id, "storage").as_deref(), Some(value));
    }
}

#[test]
fn test_migration_failure_keeps_committed_batches() {
    let engine = engine();
    let model = model(&engine, "mysql_aes", &[("key", "migrate")]);
    let ids: Vec<i64> =
        ["a", "b", "c", "d"].iter().map(|v| engine.insert(TABLE, &[("storage", Some(*v))])).collect();
    engine.fail_update_of(ids[3]);

    let result = Migrator::new(&model).with_batch_size(2).encrypt_table(&*engine);

    assert!(matches!(result, Err(Error::Statement(_))));
    assert_ne!(engine.raw(TABLE, ids[0], "storage").as_deref(), Some("a"));
    assert_ne!(engine.raw(TABLE, ids[1], "storage").as_deref(), Some("b"));
    assert_eq!(engine.raw(TABLE, ids[2], "storage").as_deref(), Some("c"));
    assert_eq!(engine.raw(TABLE, ids[3], "storage").as_deref(), Some("d"));
}

#[test]
fn test_migration_decrypt_without_private_key_is_rejected() {
    let engine = engine();
    let public = armored("PUBLIC", "ops");
    let writer = model(&engine, "postgres_pgp_pub_key", &[("public_key", public.as_str())]);
    let id = engine.insert(TABLE, &[("storage", Some("salary"))]);

    let report = Migrator::new(&writer).encrypt_table(&*engine).unwrap();
    assert_eq!(report.transformed, 1);
    let raw = engine.raw(TABLE, id, "storage").unwrap();
    assert_ne!(raw, "salary");

    let result = Migrator::new(&writer).decrypt_table(&*engine);
    assert!(matches!(result, Err(Error::Configuration(_))));
    assert_eq!(engine.raw(TABLE, id, "storage"), Some(raw));
}

#[test]
fn test_model_from_toml_file() {
    let mut file = Builder::new().suffix(".toml").tempfile().expect("Failed to create temp file");
    writeln!(
        file,
        "provider = \"postgres_raw\"\nfields = [\"storage\"]\n\n[options]\nkey = \"from-file\"\niv = \"0123456789abcdef\""
    )
    .unwrap();

    let config: FieldConfig = config::Config::builder()
        .add_source(config::File::from(file.path()).format(config::FileFormat::Toml))
        .build()
        .and_then(config::Config::try_deserialize)
        .expect("Failed to read config");
    assert!(config.lazy);

    let engine = engine();
    let model = EncryptedModel::from_config(TABLE, &config, Some(engine.clone() as Arc<dyn Storage>), Settings::shared())
        .unwrap();
    let id = store(&engine, &model, Some("value"));
    assert_eq!(load(&engine, &model, id).as_deref(), Some("value"));
}
