#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Read;
    use std::os::unix::fs::symlink;

    use tempfile::TempDir;
    use termsend::cli::Mode;
    use termsend::transfer::plan::{files_for_send, FileState, PlanOptions};
    use termsend::transfer::protocol::{Compression, FileKind, TransmissionType};

    fn opts(mode: Mode) -> PlanOptions {
        PlanOptions {
            mode,
            transmit_deltas: false,
        }
    }

    fn normal_args(sources: &[&str], dest: &str) -> Vec<String> {
        sources
            .iter()
            .map(|s| s.to_string())
            .chain(std::iter::once(dest.to_string()))
            .collect()
    }

    #[test]
    fn test_ids_are_walk_ordered_hex() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("tree");
        fs::create_dir(&root).unwrap();
        for i in 0..17 {
            fs::write(root.join(format!("f{i:02}")), "x").unwrap();
        }

        let args = normal_args(&[root.to_str().unwrap()], "dest");
        let files = files_for_send(&opts(Mode::Normal), &args).unwrap();

        assert_eq!(files.len(), 18);
        for (idx, file) in files.iter().enumerate() {
            assert_eq!(file.file_id, format!("{:x}", idx + 1));
            assert_eq!(file.state, FileState::WaitingForStart);
        }
        // id 16 renders as hex without prefix
        assert_eq!(files[15].file_id, "10");
    }

    #[test]
    fn test_directory_children_nest_under_basename() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("docs");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("a.txt"), "aaa").unwrap();

        let args = normal_args(&[root.to_str().unwrap()], "dest");
        let files = files_for_send(&opts(Mode::Normal), &args).unwrap();

        assert_eq!(files[0].kind, FileKind::Directory);
        assert_eq!(files[0].remote_path, "dest");
        assert_eq!(files[1].remote_path, "dest/docs/a.txt");
    }

    #[test]
    fn test_trailing_slash_base_places_basenames() {
        let tmp = TempDir::new().unwrap();
        let one = tmp.path().join("one.txt");
        let two = tmp.path().join("two.txt");
        fs::write(&one, "1").unwrap();
        fs::write(&two, "2").unwrap();

        // two sources force the trailing slash even when it is missing
        let args = normal_args(&[one.to_str().unwrap(), two.to_str().unwrap()], "dest");
        let files = files_for_send(&opts(Mode::Normal), &args).unwrap();

        assert_eq!(files[0].remote_path, "dest/one.txt");
        assert_eq!(files[1].remote_path, "dest/two.txt");
    }

    #[test]
    fn test_hard_link_pair_becomes_link_entry() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        fs::write(&a, [7u8; 100]).unwrap();
        fs::hard_link(&a, &b).unwrap();

        let args = normal_args(&[a.to_str().unwrap(), b.to_str().unwrap()], "dest/");
        let mut files = files_for_send(&opts(Mode::Normal), &args).unwrap();

        assert_eq!(files.len(), 2);
        assert_eq!(files[0].kind, FileKind::Regular);
        assert_eq!(files[1].kind, FileKind::Link);
        assert_eq!(files[1].hard_link_target, "1");

        // the link entry's whole payload is the target id
        files[1].state = FileState::Transmitting;
        let (payload, consumed) = files[1].next_chunk(1024).unwrap();
        assert_eq!(payload.as_ref(), b"1");
        assert_eq!(consumed, 1);
        assert_eq!(files[1].state, FileState::Finished);
    }

    #[test]
    fn test_symlink_to_planned_file_uses_fid() {
        let tmp = TempDir::new().unwrap();
        let real = tmp.path().join("real");
        let link = tmp.path().join("s");
        fs::write(&real, "12345").unwrap();
        symlink(&real, &link).unwrap();

        let args = normal_args(&[real.to_str().unwrap(), link.to_str().unwrap()], "dest/");
        let mut files = files_for_send(&opts(Mode::Normal), &args).unwrap();

        assert_eq!(files[0].kind, FileKind::Regular);
        assert_eq!(files[1].kind, FileKind::Symlink);
        assert_eq!(files[1].symbolic_link_target, "fid:1");

        files[1].state = FileState::Transmitting;
        let (payload, _) = files[1].next_chunk(1024).unwrap();
        assert_eq!(payload.as_ref(), b"fid:1");
    }

    #[test]
    fn test_relative_symlink_to_planned_file_uses_fid() {
        let tmp = TempDir::new().unwrap();
        let real = tmp.path().join("real");
        let link = tmp.path().join("s");
        fs::write(&real, "12345").unwrap();
        symlink("real", &link).unwrap();

        let args = normal_args(&[real.to_str().unwrap(), link.to_str().unwrap()], "dest/");
        let files = files_for_send(&opts(Mode::Normal), &args).unwrap();
        assert_eq!(files[1].symbolic_link_target, "fid:1");
    }

    #[test]
    fn test_symlink_to_unplanned_target_stays_literal() {
        let tmp = TempDir::new().unwrap();
        let outside = tmp.path().join("outside");
        let link = tmp.path().join("s");
        fs::write(&outside, "o").unwrap();
        symlink(&outside, &link).unwrap();

        let args = normal_args(&[link.to_str().unwrap()], "dest");
        let files = files_for_send(&opts(Mode::Normal), &args).unwrap();

        assert_eq!(files.len(), 1);
        assert_eq!(
            files[0].symbolic_link_target,
            format!("path:{}", outside.display())
        );
    }

    #[test]
    fn test_dangling_symlink_keeps_literal_target() {
        let tmp = TempDir::new().unwrap();
        let link = tmp.path().join("dangling");
        symlink("/no/such/target", &link).unwrap();

        let args = normal_args(&[link.to_str().unwrap()], "dest");
        let files = files_for_send(&opts(Mode::Normal), &args).unwrap();

        assert_eq!(files.len(), 1);
        assert_eq!(files[0].symbolic_link_target, "path:/no/such/target");
    }

    #[test]
    fn test_compression_heuristic() {
        let tmp = TempDir::new().unwrap();
        let big_text = tmp.path().join("big.txt");
        let big_zip = tmp.path().join("big.zip");
        let small_text = tmp.path().join("small.txt");
        fs::write(&big_text, vec![b'a'; 10_000]).unwrap();
        fs::write(&big_zip, vec![b'a'; 10_000]).unwrap();
        fs::write(&small_text, b"tiny").unwrap();

        let args = normal_args(
            &[
                big_text.to_str().unwrap(),
                big_zip.to_str().unwrap(),
                small_text.to_str().unwrap(),
            ],
            "dest/",
        );
        let files = files_for_send(&opts(Mode::Normal), &args).unwrap();

        assert_eq!(files[0].compression, Compression::Zlib);
        assert_eq!(files[1].compression, Compression::None);
        assert_eq!(files[2].compression, Compression::None);
    }

    #[test]
    fn test_transmit_deltas_marks_regular_files() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("d");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("f"), "x").unwrap();

        let plan_opts = PlanOptions {
            mode: Mode::Normal,
            transmit_deltas: true,
        };
        let args = normal_args(&[root.to_str().unwrap()], "dest");
        let files = files_for_send(&plan_opts, &args).unwrap();

        assert_eq!(files[0].ttype, TransmissionType::Simple);
        assert_eq!(files[1].ttype, TransmissionType::Rsync);
    }

    #[test]
    fn test_chunked_read_accounts_for_every_byte() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("blob.txt");
        let content: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&path, &content).unwrap();

        let args = normal_args(&[path.to_str().unwrap()], "dest");
        let mut files = files_for_send(&opts(Mode::Normal), &args).unwrap();
        let file = &mut files[0];
        assert_eq!(file.compression, Compression::Zlib);

        file.state = FileState::Transmitting;
        let mut consumed_total = 0;
        let mut wire = Vec::new();
        while file.state != FileState::Finished {
            let (chunk, consumed) = file.next_chunk(1024).unwrap();
            consumed_total += consumed;
            wire.extend_from_slice(&chunk);
        }
        assert_eq!(consumed_total, content.len());

        let mut inflated = Vec::new();
        flate2::read::ZlibDecoder::new(wire.as_slice())
            .read_to_end(&mut inflated)
            .unwrap();
        assert_eq!(inflated, content);
    }

    #[test]
    fn test_uncompressed_read_is_identity() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("small.bin");
        fs::write(&path, b"hello world\n").unwrap();

        let args = normal_args(&[path.to_str().unwrap()], "dest");
        let mut files = files_for_send(&opts(Mode::Normal), &args).unwrap();
        let file = &mut files[0];

        file.state = FileState::Transmitting;
        let (chunk, consumed) = file.next_chunk(1024 * 1024).unwrap();
        assert_eq!(chunk.as_ref(), b"hello world\n");
        assert_eq!(consumed, 12);
        assert_eq!(file.state, FileState::Finished);
    }

    #[test]
    fn test_mirror_mode_keeps_absolute_paths_outside_home() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data.txt");
        fs::write(&path, "d").unwrap();

        let args = vec![path.to_str().unwrap().to_string()];
        let files = files_for_send(&opts(Mode::Mirror), &args).unwrap();

        assert_eq!(files.len(), 1);
        assert_eq!(files[0].remote_path, path.to_str().unwrap());
    }
}
