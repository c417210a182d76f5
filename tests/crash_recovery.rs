// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! S4: recovering a file-backed store, per §4.7. The actual
//! dead-holder / torn-entry fault injection needs direct access to the
//! segment lock and tier internals (see `src/recovery.rs`'s own unit
//! tests); this file exercises the public surface recovery promises:
//! same-configuration and self-describing recovery on a populated store,
//! and self-describing recovery's refusal to trust a header it cannot
//! validate.

use cmap::{CMap, Config, Error};

#[test]
fn same_config_recovery_preserves_every_entry() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s4_same_config.cmap");
    let config = Config::builder(64).segments(4).checksum_entries(true).finish(true);

    {
        let map: CMap<u32, u32> = CMap::create_file(&path, config).unwrap();
        for i in 0..40u32 {
            map.put(&i, &(i * 3)).unwrap();
        }
        map.flush().unwrap();
    }

    let recovered: CMap<u32, u32> = CMap::recover_file(&path, Some(config)).unwrap();
    assert_eq!(recovered.size(), 40);
    for i in 0..40u32 {
        assert_eq!(recovered.get(&i).unwrap(), Some(i * 3));
    }
}

#[test]
fn self_describing_recovery_preserves_every_entry() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s4_self_describing.cmap");
    let config = Config::builder(32).segments(2).checksum_entries(true).finish(true);

    {
        let map: CMap<String, String> = CMap::create_file(&path, config).unwrap();
        map.put(&"alpha".to_string(), &"one".to_string()).unwrap();
        map.put(&"beta".to_string(), &"two".to_string()).unwrap();
        map.flush().unwrap();
    }

    let recovered: CMap<String, String> = CMap::recover_file(&path, None).unwrap();
    assert_eq!(recovered.get(&"alpha".to_string()).unwrap(), Some("one".to_string()));
    assert_eq!(recovered.get(&"beta".to_string()).unwrap(), Some("two".to_string()));
}

#[test]
fn self_describing_recovery_refuses_a_file_with_no_valid_header() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s4_garbage.cmap");
    std::fs::write(&path, vec![0u8; 8192]).unwrap();

    let err = CMap::<u32, u32>::recover_file(&path, None).unwrap_err();
    assert!(matches!(err, Error::RecoveryFailed));
}

#[test]
fn same_config_recovery_rewrites_an_unreadable_header_instead_of_failing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s4_rewrite.cmap");
    let config = Config::builder(16).segments(1).finish(true);
    std::fs::write(&path, vec![0u8; 16 * 1024]).unwrap();

    let recovered: CMap<u32, u32> = CMap::recover_file(&path, Some(config)).unwrap();
    assert_eq!(recovered.config(), &config);
    assert_eq!(recovered.size(), 0);
}
