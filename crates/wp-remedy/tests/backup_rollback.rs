mod support;

use std::fs;

use wp_remedy::Error;
use wp_remedy::audit;
use wp_remedy::backup::{ArtifactType, BackupMetadata};
use wp_remedy::store::{ArtifactStore, IncidentRecord};

use support::{Harness, INCIDENT, SERVER};

#[test]
fn wp_config_backup_validates() {
    let h = Harness::new();
    let path = h.write("wp-config.php", &"x".repeat(1024));

    let res = h
        .backups
        .create_file_backup(
            INCIDENT,
            SERVER,
            &path,
            ArtifactType::WpConfigBackup,
            BackupMetadata::reason("pre-fix snapshot"),
        )
        .expect("backup");
    assert!(res.success, "{:?}", res.error);
    let artifact = res.artifact.expect("artifact");
    assert_eq!(artifact.size_bytes, 1024);
    assert_eq!(artifact.original_path, path);
    assert_eq!(artifact.metadata.original_size, Some(1024));
    assert_eq!(artifact.metadata.server_id.as_deref(), Some(SERVER));
    assert_eq!(artifact.metadata.backup_reason.as_deref(), Some("pre-fix snapshot"));
    assert!(artifact.local_path.is_file());
    assert_eq!(artifact.checksum.len(), 64);

    let report = h
        .backups
        .validate_backup_artifact(&artifact.id)
        .expect("validate");
    assert!(report.is_valid);
    assert!(report.checksum_match);
    assert!(report.file_exists);
    assert!(report.size_match);

    assert_eq!(h.audit.with_action(audit::BACKUP_CREATED).len(), 1);
    assert_eq!(h.audit.with_action(audit::BACKUP_VALIDATED).len(), 1);
}

#[test]
fn tampered_backup_fails_validation() {
    let h = Harness::new();
    let path = h.write("wp-config.php", "<?php define('DB_NAME', 'wp');");
    let artifact = h
        .backups
        .create_file_backup(INCIDENT, SERVER, &path, ArtifactType::WpConfigBackup, BackupMetadata::default())
        .expect("backup")
        .into_artifact()
        .expect("artifact");

    fs::write(&artifact.local_path, "<?php define('DB_NAME', 'evil');").expect("tamper");
    let report = h
        .backups
        .validate_backup_artifact(&artifact.id)
        .expect("validate");
    assert!(!report.is_valid);
    assert!(report.file_exists);
    assert!(!report.checksum_match);
}

#[test]
fn validating_an_unknown_artifact_is_still_audited() {
    let h = Harness::new();
    let err = h
        .backups
        .validate_backup_artifact("no-such-artifact")
        .expect_err("unknown");
    assert!(err.is_not_found());
    let events = h.audit.with_action(audit::BACKUP_VALIDATED);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].resource_id, "no-such-artifact");
    assert_eq!(events[0].details["found"], false);
    assert_eq!(events[0].details["is_valid"], false);
}

#[test]
fn missing_remote_file_is_a_creation_error() {
    let h = Harness::new();
    let err = h
        .backups
        .create_file_backup(
            INCIDENT,
            SERVER,
            &h.site_path("nope.php"),
            ArtifactType::FileBackup,
            BackupMetadata::default(),
        )
        .expect_err("missing file");
    assert!(matches!(err, Error::Creation { .. }), "{err}");
    assert_eq!(h.audit.with_action(audit::BACKUP_CREATE_FAILED).len(), 1);
    assert!(h.store.list_backups(INCIDENT).expect("list").is_empty());
}

#[test]
fn unknown_incident_is_not_found() {
    let h = Harness::new();
    let path = h.write("a.txt", "a");
    let err = h
        .backups
        .create_file_backup("inc-404", SERVER, &path, ArtifactType::FileBackup, BackupMetadata::default())
        .expect_err("unknown incident");
    assert!(err.is_not_found());
}

#[test]
fn oversized_file_is_refused() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let h = Harness::new();
    let path = h.write("big.log", &"y".repeat(4096));
    let mut settings = h.backups.settings().clone();
    settings.max_backup_bytes = 1000;
    settings.local_dir = tmp.path().to_path_buf();
    let small = wp_remedy::backup::BackupManager::new(
        h.store.clone(),
        h.channel.clone(),
        h.audit.clone(),
        settings,
    );
    let err = small
        .create_file_backup(INCIDENT, SERVER, &path, ArtifactType::FileBackup, BackupMetadata::default())
        .expect_err("too large");
    assert!(matches!(
        err,
        Error::InsufficientStorage {
            required: 4096,
            limit: 1000
        }
    ));
    assert_eq!(fs::read_dir(tmp.path()).expect("read dir").count(), 0);
}

#[test]
fn rollback_restores_newest_first() {
    let h = Harness::new();
    let first = h.write("first.txt", "first v1");
    let second = h.write("second.txt", "second v1");
    let a = h
        .backups
        .create_file_backup(INCIDENT, SERVER, &first, ArtifactType::FileBackup, BackupMetadata::default())
        .expect("backup a")
        .into_artifact()
        .expect("artifact a");
    let b = h
        .backups
        .create_file_backup(INCIDENT, SERVER, &second, ArtifactType::FileBackup, BackupMetadata::default())
        .expect("backup b")
        .into_artifact()
        .expect("artifact b");
    assert!(b.created_at >= a.created_at);

    fs::write(&first, "first v2").expect("mutate first");
    fs::write(&second, "second v2").expect("mutate second");

    let res = h.backups.execute_rollback(INCIDENT, None).expect("rollback");
    assert!(res.success);
    assert_eq!(res.processed_artifacts, vec![b.id.clone(), a.id.clone()]);
    assert_eq!(res.restored_files, vec![second.clone(), first.clone()]);
    assert_eq!(fs::read_to_string(&first).expect("read"), "first v1");
    assert_eq!(fs::read_to_string(&second).expect("read"), "second v1");

    let upload_second = h.channel.position(&format!("upload: {second}")).expect("second uploaded");
    let upload_first = h.channel.position(&format!("upload: {first}")).expect("first uploaded");
    assert!(upload_second < upload_first);

    let listed: Vec<String> = h
        .backups
        .list_backups(INCIDENT)
        .expect("list")
        .into_iter()
        .map(|a| a.id)
        .collect();
    assert_eq!(listed, vec![b.id, a.id]);
}

#[test]
fn rollback_continues_past_a_failed_artifact() {
    let h = Harness::new();
    let path1 = h.write("ok/one.txt", "one v1");
    let path2 = h.write("broken/two.txt", "two v1");
    for p in [&path1, &path2] {
        h.backups
            .create_file_backup(INCIDENT, SERVER, p, ArtifactType::FileBackup, BackupMetadata::default())
            .expect("backup")
            .into_artifact()
            .expect("artifact");
    }

    fs::write(&path1, "one v2").expect("mutate one");
    // A regular file where the parent directory should be makes the restore fail.
    let broken_dir = h.site_dir().join("broken");
    fs::remove_dir_all(&broken_dir).expect("remove dir");
    fs::write(&broken_dir, "not a directory").expect("block parent");

    let res = h.backups.execute_rollback(INCIDENT, None).expect("rollback");
    assert!(!res.success);
    assert_eq!(res.restored_files, vec![path1.clone()]);
    assert_eq!(res.failed_files, vec![path2.clone()]);
    assert_eq!(res.failures.len(), 1);
    assert_eq!(res.processed_artifacts.len(), 2);
    assert_eq!(fs::read_to_string(&path1).expect("read"), "one v1");

    let events = h.audit.with_action(audit::ROLLBACK_EXECUTED);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].resource_id, INCIDENT);
    assert_eq!(events[0].details["artifact_count"], 2);
    assert_eq!(events[0].details["restored"], 1);
    assert_eq!(events[0].details["failed"], 1);
    assert_eq!(events[0].details["success"], false);
}

#[test]
fn rollback_processes_every_requested_artifact() {
    let h = Harness::new();
    let mut ids = Vec::new();
    for name in ["a.txt", "b.txt", "c.txt"] {
        let p = h.write(name, name);
        ids.push(
            h.backups
                .create_file_backup(INCIDENT, SERVER, &p, ArtifactType::FileBackup, BackupMetadata::default())
                .expect("backup")
                .into_artifact()
                .expect("artifact")
                .id,
        );
    }
    // Corrupt the middle one; the other two still restore.
    let corrupt = h.backups.get_backup(&ids[1]).expect("get");
    fs::write(&corrupt.local_path, "garbage").expect("corrupt");

    let mut requested = ids.clone();
    requested.push("missing-artifact".into());
    let res = h
        .backups
        .execute_rollback(INCIDENT, Some(&requested))
        .expect("rollback");
    assert_eq!(res.restored_files.len() + res.failures.len(), 4);
    assert_eq!(res.restored_files.len(), 2);
    let failed_ids: Vec<&str> = res.failures.iter().map(|f| f.artifact_id.as_str()).collect();
    assert!(failed_ids.contains(&"missing-artifact"));
    assert!(failed_ids.contains(&ids[1].as_str()));
    assert!(res.failures.iter().any(|f| f.error.contains("corrupted")));
}

#[test]
fn rollback_without_artifacts_is_an_error() {
    let h = Harness::new();
    let err = h.backups.execute_rollback(INCIDENT, None).expect_err("nothing to restore");
    assert!(matches!(err, Error::RollbackExecution(_)));

    let err = h.backups.execute_rollback("inc-404", None).expect_err("unknown incident");
    assert!(matches!(err, Error::RollbackExecution(_)));
}

#[test]
fn rollback_ignores_other_incidents_artifacts() {
    let h = Harness::new();
    h.store
        .save_incident(&IncidentRecord::new("inc-2", "site-2", SERVER))
        .expect("save incident");
    let p = h.write("other.txt", "other");
    let foreign = h
        .backups
        .create_file_backup("inc-2", SERVER, &p, ArtifactType::FileBackup, BackupMetadata::default())
        .expect("backup")
        .into_artifact()
        .expect("artifact");
    let mine = h.write("mine.txt", "mine");
    h.backups
        .create_file_backup(INCIDENT, SERVER, &mine, ArtifactType::FileBackup, BackupMetadata::default())
        .expect("backup");

    let err = h
        .backups
        .execute_rollback(INCIDENT, Some(&[foreign.id.clone()]))
        .expect_err("only a foreign artifact was requested");
    assert!(matches!(err, Error::RollbackExecution(_)));

    let all = h.backups.execute_rollback(INCIDENT, None).expect("rollback");
    assert_eq!(all.restored_files, vec![mine]);
}

#[test]
fn directory_backup_round_trips() {
    let h = Harness::new();
    h.write("wp-content/plugins/gallery/gallery.php", "<?php // v1");
    h.write("wp-content/plugins/gallery/assets/app.js", "console.log(1);");
    let dir = h.site_path("wp-content/plugins/gallery");

    let artifact = h
        .backups
        .create_directory_backup(INCIDENT, SERVER, &dir, ArtifactType::PluginBackup, BackupMetadata::default())
        .expect("backup")
        .into_artifact()
        .expect("artifact");
    assert!(artifact.local_path.to_string_lossy().ends_with(".tar.gz"));
    assert!(artifact.metadata.compression_ratio.is_some());
    // The remote temp archive is always cleaned up.
    let remote_tmp = h.backups.settings().remote_temp_dir.clone();
    assert_eq!(fs::read_dir(&remote_tmp).expect("read tmp").count(), 0);

    fs::remove_dir_all(&dir).expect("wipe plugin");
    h.write("wp-content/plugins/gallery/injected.php", "<?php evil();");

    h.backups.restore_artifact(&artifact.id).expect("restore");
    let base = h.site_dir().join("wp-content/plugins/gallery");
    assert_eq!(
        fs::read_to_string(base.join("gallery.php")).expect("read"),
        "<?php // v1"
    );
    assert!(base.join("assets/app.js").is_file());
    assert!(!base.join("injected.php").exists());
}

#[test]
fn file_restore_puts_back_permissions() {
    let h = Harness::new();
    let path = h.write("wp-config.php", "<?php // original");
    support::set_mode(&path, 0o600);
    let artifact = h
        .backups
        .create_file_backup(INCIDENT, SERVER, &path, ArtifactType::WpConfigBackup, BackupMetadata::default())
        .expect("backup")
        .into_artifact()
        .expect("artifact");
    assert_eq!(artifact.metadata.original_permissions.as_deref(), Some("600"));

    fs::write(&path, "<?php // broken").expect("mutate");
    support::set_mode(&path, 0o666);
    h.backups.restore_artifact(&artifact.id).expect("restore");
    assert_eq!(fs::read_to_string(&path).expect("read"), "<?php // original");
    assert_eq!(support::mode_of(&path), 0o600);
    // No staged copies left beside the target.
    let leftovers = fs::read_dir(h.site_dir())
        .expect("read site")
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains("wp-remedy-restore"))
        .count();
    assert_eq!(leftovers, 0);
}

#[test]
fn deleting_a_backup_removes_file_and_record() {
    let h = Harness::new();
    let path = h.write("a.txt", "a");
    let artifact = h
        .backups
        .create_file_backup(INCIDENT, SERVER, &path, ArtifactType::FileBackup, BackupMetadata::default())
        .expect("backup")
        .into_artifact()
        .expect("artifact");
    h.backups.delete_backup_artifact(&artifact.id).expect("delete");
    assert!(!artifact.local_path.exists());
    assert!(h.backups.get_backup(&artifact.id).expect_err("gone").is_not_found());
    assert_eq!(h.audit.with_action(audit::BACKUP_DELETED).len(), 1);
}
