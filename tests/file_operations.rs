mod common;

use common::{connected, engine_config, p};

use cloudfm_lib::{
    BatchOptions, ConflictPolicy, ConnectionId, EntryKind, Error, ErrorKind, PermissionSet,
};

#[tokio::test]
async fn test_batch_delete_reports_every_path() {
    let (connector, manager, id) = connected(engine_config()).await;
    let paths = [p("/data/a.txt"), p("/data/missing.txt"), p("/data/c.txt")];

    let result = manager
        .delete(&id, &paths, &BatchOptions::default())
        .await
        .unwrap();

    assert_eq!(result.len(), 3);
    assert_eq!(result.succeeded(), 2);
    assert_eq!(result.outcomes[1].path, p("/data/missing.txt"));
    assert_eq!(result.outcomes[1].error_kind(), Some(ErrorKind::NotFound));
    assert!(!connector.fs().exists("/data/a.txt"));
    assert!(!connector.fs().exists("/data/c.txt"));
    assert!(connector.fs().exists("/data/b.txt"));
}

#[tokio::test]
async fn test_locked_entry_fails_alone() {
    let (connector, manager, id) = connected(engine_config()).await;
    connector.fs().lock("/data/b.txt").unwrap();
    let paths = [p("/data/a.txt"), p("/data/b.txt"), p("/data/c.txt")];

    let result = manager
        .delete(&id, &paths, &BatchOptions::default())
        .await
        .unwrap();

    let failures: Vec<_> = result.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].path, p("/data/b.txt"));
    assert_eq!(failures[0].error_kind(), Some(ErrorKind::PermissionDenied));
    assert!(connector.fs().exists("/data/b.txt"));
}

#[tokio::test]
async fn test_cancelled_batch_touches_nothing() {
    let (connector, manager, id) = connected(engine_config()).await;
    let options = BatchOptions::default();
    options.cancel.cancel();

    let result = manager
        .delete(&id, &[p("/data/a.txt"), p("/data/b.txt")], &options)
        .await
        .unwrap();

    assert_eq!(result.len(), 2);
    assert!(result
        .outcomes
        .iter()
        .all(|o| o.error_kind() == Some(ErrorKind::Cancelled)));
    assert!(connector.fs().exists("/data/a.txt"));
}

#[tokio::test]
async fn test_create_directory_twice() {
    let (_connector, manager, id) = connected(engine_config()).await;

    manager.create_directory(&id, &p("/data/new")).await.unwrap();
    let err = manager
        .create_directory(&id, &p("/data/new"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);

    let entry = manager.stat(&id, &p("/data/new")).await.unwrap();
    assert_eq!(entry.kind, EntryKind::Directory);
}

#[tokio::test]
async fn test_equivalent_spellings_address_one_entry() {
    let (_connector, manager, id) = connected(engine_config()).await;
    let messy = p("/data//docs/./../docs/guides/");
    assert_eq!(messy, p("/data/docs/guides"));

    manager.create_directory(&id, &messy).await.unwrap();
    assert!(matches!(
        manager.create_directory(&id, &p("/data/docs/guides")).await,
        Err(Error::AlreadyExists(_))
    ));

    let names: Vec<String> = manager
        .list_directory(&id, &p("/data/docs/"))
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert!(names.contains(&"guides".to_string()));
    assert!(names.contains(&"readme.md".to_string()));
}

#[tokio::test]
async fn test_listing_reflects_mutations() {
    let (_connector, manager, id) = connected(engine_config()).await;
    let before = manager.list_directory(&id, &p("/data")).await.unwrap();
    assert_eq!(before.len(), 4);

    manager
        .delete(&id, &[p("/data/a.txt")], &BatchOptions::default())
        .await
        .unwrap();
    manager
        .rename(&id, &p("/data/b.txt"), &p("/data/renamed.txt"))
        .await
        .unwrap();

    let mut names: Vec<String> = manager
        .list_directory(&id, &p("/data"))
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["c.txt", "docs", "renamed.txt"]);
}

#[tokio::test]
async fn test_list_file_is_not_a_directory() {
    let (_connector, manager, id) = connected(engine_config()).await;
    assert!(matches!(
        manager.list_directory(&id, &p("/data/a.txt")).await,
        Err(Error::NotADirectory(_))
    ));
    assert!(matches!(
        manager.list_directory(&id, &p("/nowhere")).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_set_permissions_round_trip() {
    let (connector, manager, id) = connected(engine_config()).await;
    let mode = PermissionSet::parse_symbolic("rwxr-x---").unwrap();

    let result = manager
        .set_permissions(
            &id,
            &[p("/data/a.txt"), p("/data/gone.txt")],
            mode,
            &BatchOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.succeeded(), 1);
    assert_eq!(result.outcomes[1].error_kind(), Some(ErrorKind::NotFound));

    let entry = manager.stat(&id, &p("/data/a.txt")).await.unwrap();
    assert_eq!(entry.mode, mode);
    assert_eq!(entry.mode.to_symbolic(), "rwxr-x---");
    assert_eq!(PermissionSet::parse_octal(&entry.mode.to_octal()).unwrap(), mode);
    assert_eq!(connector.fs().mode("/data/a.txt"), Some(mode));
}

#[tokio::test]
async fn test_move_honours_conflict_policy() {
    let (connector, manager, id) = connected(engine_config()).await;
    connector.fs().add_file("/backup/a.txt", "stale").unwrap();
    let sources = [p("/data/a.txt"), p("/data/nope.txt")];

    let rejected = manager
        .move_paths(&id, &sources, &p("/backup"), &BatchOptions::default())
        .await
        .unwrap();
    assert_eq!(rejected.outcomes[0].error_kind(), Some(ErrorKind::AlreadyExists));
    assert_eq!(rejected.outcomes[1].error_kind(), Some(ErrorKind::NotFound));
    assert_eq!(connector.fs().read("/backup/a.txt").unwrap(), b"stale");

    let replaced = manager
        .move_paths(
            &id,
            &sources[..1],
            &p("/backup"),
            &BatchOptions::with_policy(ConflictPolicy::Overwrite),
        )
        .await
        .unwrap();
    assert!(replaced.all_succeeded());
    assert_eq!(connector.fs().read("/backup/a.txt").unwrap(), b"alpha");
    assert!(!connector.fs().exists("/data/a.txt"));
}

#[tokio::test]
async fn test_copy_directory_recursively() {
    let (connector, manager, id) = connected(engine_config()).await;

    let result = manager
        .copy_paths(
            &id,
            &[p("/data/docs"), p("/data/b.txt")],
            &p("/backup"),
            &BatchOptions::default(),
        )
        .await
        .unwrap();

    assert!(result.all_succeeded());
    assert_eq!(connector.fs().read("/backup/docs/readme.md").unwrap(), b"# readme");
    assert_eq!(connector.fs().read("/backup/b.txt").unwrap(), b"bravo");
    assert!(connector.fs().exists("/data/docs/readme.md"));
}

#[tokio::test]
async fn test_read_and_write_file() {
    let mut config = engine_config();
    config.read_limit_bytes = 16;
    let (connector, manager, id) = connected(config).await;

    manager
        .write_file(&id, &p("/data/notes.txt"), b"draft one")
        .await
        .unwrap();
    let content = manager.read_file(&id, &p("/data/notes.txt")).await.unwrap();
    assert_eq!(content.data, b"draft one");
    assert_eq!(content.path, p("/data/notes.txt"));

    connector.fs().add_file("/data/big.bin", vec![0u8; 64]).unwrap();
    assert!(matches!(
        manager.read_file(&id, &p("/data/big.bin")).await,
        Err(Error::TooLarge { .. })
    ));
}

#[tokio::test]
async fn test_unknown_connection_is_rejected() {
    let (_connector, manager, _id) = connected(engine_config()).await;
    let stranger = ConnectionId::new();
    assert!(matches!(
        manager.list_directory(&stranger, &p("/data")).await,
        Err(Error::UnknownConnection(_))
    ));
    assert!(matches!(
        manager
            .delete(&stranger, &[p("/data/a.txt")], &BatchOptions::default())
            .await,
        Err(Error::UnknownConnection(_))
    ));
}
