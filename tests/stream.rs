use lzcore::codec::{ZstdDecoder, ZstdEncoder};
use lzcore::coder::CopyCoder;
use lzcore::{Action, Check, Error, Filter, Index, Status, Stream, SubfilterCommand};

/// Call `code` with a small output window until the chain reports the end.
fn drive(strm: &mut Stream, input: &[u8], action: Action) -> Vec<u8> {
    let mut out = Vec::new();
    let mut in_pos = 0;
    let mut buf = [0u8; 64];
    loop {
        let mut out_pos = 0;
        let status = strm.code(input, &mut in_pos, &mut buf, &mut out_pos, action).unwrap();
        out.extend_from_slice(&buf[..out_pos]);
        if status == Status::StreamEnd {
            assert_eq!(in_pos, input.len());
            return out;
        }
    }
}

fn sample(len: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(len);
    let mut i = 0;
    while data.len() < len {
        data.extend_from_slice(format!("record {} of the sample payload\n", i % 500).as_bytes());
        i += 1;
    }
    data.truncate(len);
    data
}

// ── Initialisation ───────────────────────────────────────────────────────────

#[test]
fn test_uninitialized_stream() {
    let mut strm = Stream::new();
    assert!(matches!(strm.process(b"abc", &mut [0u8; 8], Action::Run), Err(Error::Prog(_))));
    assert_eq!(strm.subfilter(SubfilterCommand::Query), Err(Error::Unsupported));
    assert!(matches!(strm.set_memlimit(1), Err(Error::Prog(_))));
    assert_eq!(strm.check(), Check::None);
}

#[test]
fn test_invalid_chain_ends_stream() {
    let mut strm = Stream::new_raw_encoder(&[Filter::Copy]).unwrap();

    let err = strm.raw_encoder(&[Filter::Zstd { level: 100 }]).unwrap_err();
    assert!(matches!(err, Error::Options(_)));
    assert!(strm.coder::<CopyCoder>().is_none());
    assert!(matches!(strm.process(b"abc", &mut [0u8; 8], Action::Run), Err(Error::Prog(_))));

    assert!(matches!(Stream::new_raw_encoder(&[]), Err(Error::Options(_))));
    assert!(matches!(Stream::new_raw_decoder(&vec![Filter::Copy; 5]), Err(Error::Options(_))));
}

#[test]
fn test_reinit_reuses_same_node() {
    let mut strm = Stream::new_raw_encoder(&[Filter::Copy]).unwrap();
    let before = strm.coder::<CopyCoder>().unwrap() as *const CopyCoder;

    strm.raw_encoder(&[Filter::Copy]).unwrap();
    let after = strm.coder::<CopyCoder>().unwrap() as *const CopyCoder;
    assert!(std::ptr::eq(before, after));

    strm.raw_encoder(&[Filter::Zstd { level: 1 }]).unwrap();
    assert!(strm.coder::<CopyCoder>().is_none());
    assert!(strm.coder::<ZstdEncoder>().is_some());

    strm.raw_decoder(&[Filter::Zstd { level: 1 }]).unwrap();
    assert!(strm.coder::<ZstdDecoder>().is_some());
}

#[test]
fn test_reinit_resets_totals() {
    let mut strm = Stream::new_raw_encoder(&[Filter::Copy]).unwrap();
    drive(&mut strm, b"hello", Action::Finish);
    assert_eq!(strm.total_in(), 5);

    strm.raw_encoder(&[Filter::Copy]).unwrap();
    assert_eq!((strm.total_in(), strm.total_out()), (0, 0));
    assert_eq!(drive(&mut strm, b"again", Action::Finish), b"again");
}

#[test]
fn test_end_releases_chain() {
    let mut strm = Stream::new_raw_encoder(&[Filter::Copy]).unwrap();
    strm.end();
    assert!(strm.coder::<CopyCoder>().is_none());
    assert!(matches!(strm.process(b"", &mut [0u8; 4], Action::Run), Err(Error::Prog(_))));
}

// ── Actions ──────────────────────────────────────────────────────────────────

#[test]
fn test_unsupported_actions() {
    let mut dec = Stream::new_raw_decoder(&[Filter::Copy]).unwrap();
    assert!(matches!(dec.process(b"x", &mut [0u8; 4], Action::SyncFlush), Err(Error::Prog(_))));
    assert!(matches!(dec.process(b"x", &mut [0u8; 4], Action::FullFlush), Err(Error::Prog(_))));

    let mut enc = Stream::new_index_encoder(Index::new()).unwrap();
    assert!(matches!(enc.process(b"", &mut [0u8; 4], Action::SyncFlush), Err(Error::Prog(_))));
}

#[test]
fn test_action_lock() {
    let input = b"0123456789";
    let mut strm = Stream::new_raw_encoder(&[Filter::Copy]).unwrap();
    let mut in_pos = 0;
    let mut buf = [0u8; 4];

    let mut out_pos = 0;
    let status = strm.code(input, &mut in_pos, &mut buf, &mut out_pos, Action::Finish).unwrap();
    assert_eq!((status, in_pos, out_pos), (Status::Ok, 4, 4));

    // Switching action or adding input mid-finish is refused.
    let mut out_pos = 0;
    assert!(matches!(
        strm.code(input, &mut in_pos, &mut buf, &mut out_pos, Action::Run),
        Err(Error::Prog(_))
    ));
    assert!(matches!(
        strm.code(b"0123456789!", &mut in_pos, &mut buf, &mut out_pos, Action::Finish),
        Err(Error::Prog(_))
    ));
    assert_eq!((in_pos, out_pos), (4, 0));

    // Neither rejection poisons the session.
    let mut out = b"0123".to_vec();
    loop {
        let mut out_pos = 0;
        let status = strm.code(input, &mut in_pos, &mut buf, &mut out_pos, Action::Finish).unwrap();
        out.extend_from_slice(&buf[..out_pos]);
        if status == Status::StreamEnd {
            break;
        }
    }
    assert_eq!(out, input);

    // Finished sessions keep answering StreamEnd without touching buffers.
    let mut out_pos = 0;
    assert_eq!(
        strm.code(b"more", &mut 0, &mut buf, &mut out_pos, Action::Run),
        Ok(Status::StreamEnd)
    );
    assert_eq!(out_pos, 0);
}

#[test]
fn test_action_lock_during_sync_flush() {
    let input = b"0123456789";
    let mut strm = Stream::new_raw_encoder(&[Filter::Copy]).unwrap();
    let mut in_pos = 0;
    let mut buf = [0u8; 4];

    let mut out_pos = 0;
    let status = strm.code(input, &mut in_pos, &mut buf, &mut out_pos, Action::SyncFlush).unwrap();
    assert_eq!((status, in_pos, out_pos), (Status::Ok, 4, 4));

    let mut out_pos = 0;
    for action in [Action::Run, Action::FullFlush, Action::Finish] {
        assert!(matches!(
            strm.code(input, &mut in_pos, &mut buf, &mut out_pos, action),
            Err(Error::Prog(_))
        ));
    }
    assert!(matches!(
        strm.code(b"0123456789abc", &mut in_pos, &mut buf, &mut out_pos, Action::SyncFlush),
        Err(Error::Prog(_))
    ));
    assert_eq!((in_pos, out_pos), (4, 0));

    let mut out = b"0123".to_vec();
    loop {
        let mut out_pos = 0;
        let status = strm.code(input, &mut in_pos, &mut buf, &mut out_pos, Action::SyncFlush).unwrap();
        out.extend_from_slice(&buf[..out_pos]);
        if status == Status::StreamEnd {
            break;
        }
    }
    assert_eq!(out, input);

    // Once the flush completes any action is accepted again.
    let (status, read, written) = strm.process(b"xy", &mut buf, Action::Run).unwrap();
    assert_eq!((status, read, written), (Status::Ok, 2, 2));
}

#[test]
fn test_sync_flush_returns_to_run() {
    let mut strm = Stream::new_raw_encoder(&[Filter::Copy]).unwrap();
    assert_eq!(drive(&mut strm, b"abc", Action::SyncFlush), b"abc");
    assert_eq!(drive(&mut strm, b"def", Action::FullFlush), b"def");

    let (status, read, written) = strm.process(b"ghi", &mut [0u8; 8], Action::Run).unwrap();
    assert_eq!((status, read, written), (Status::Ok, 3, 3));
    assert_eq!(drive(&mut strm, b"", Action::Finish), b"");
    assert_eq!((strm.total_in(), strm.total_out()), (9, 9));
}

#[test]
fn test_no_progress_reports_buf_once() {
    let mut strm = Stream::new_raw_encoder(&[Filter::Copy]).unwrap();

    assert_eq!(strm.process(b"", &mut [0u8; 4], Action::Run), Ok((Status::Ok, 0, 0)));
    let err = strm.process(b"", &mut [0u8; 4], Action::Run).unwrap_err();
    assert_eq!(err, Error::Buf);
    assert!(err.is_recoverable());

    // Buf is not fatal, and progress clears the flag.
    assert_eq!(strm.process(b"ab", &mut [0u8; 4], Action::Run), Ok((Status::Ok, 2, 2)));
    assert_eq!(strm.process(b"", &mut [0u8; 4], Action::Run), Ok((Status::Ok, 0, 0)));
}

#[test]
fn test_full_output_is_no_progress() {
    let mut strm = Stream::new_raw_encoder(&[Filter::Copy]).unwrap();
    assert_eq!(strm.process(b"ab", &mut [], Action::Run), Ok((Status::Ok, 0, 0)));
    assert_eq!(strm.process(b"ab", &mut [], Action::Run), Err(Error::Buf));
}

#[test]
fn test_fatal_error_sticks() {
    let mut strm = Stream::new_raw_decoder(&[Filter::Zstd { level: 3 }]).unwrap();
    let err = strm.process(b"definitely not zstd", &mut [0u8; 64], Action::Run).unwrap_err();
    assert!(matches!(err, Error::Data(_)));
    assert!(!err.is_recoverable());
    assert!(matches!(strm.process(b"", &mut [0u8; 64], Action::Run), Err(Error::Prog(_))));

    // Reinitialising recovers.
    strm.raw_decoder(&[Filter::Copy]).unwrap();
    assert_eq!(drive(&mut strm, b"ok", Action::Finish), b"ok");
}

#[test]
fn test_bad_positions_rejected() {
    let mut strm = Stream::new_raw_encoder(&[Filter::Copy]).unwrap();
    let mut out_pos = 0;
    assert!(matches!(
        strm.code(b"ab", &mut 3, &mut [0u8; 4], &mut out_pos, Action::Run),
        Err(Error::Prog(_))
    ));
}

// ── Hooks ────────────────────────────────────────────────────────────────────

#[test]
fn test_hooks_on_plain_chains() {
    let mut strm = Stream::new_raw_encoder(&[Filter::Copy, Filter::Zstd { level: 3 }]).unwrap();
    assert_eq!(strm.check(), Check::None);
    assert_eq!(strm.memusage(), None);
    assert_eq!(strm.memlimit(), None);
    assert_eq!(strm.set_memlimit(1 << 20), Err(Error::Unsupported));
    assert_eq!(strm.subfilter(SubfilterCommand::Query), Err(Error::Unsupported));

    let strm = Stream::new_index_encoder(Index::new()).unwrap();
    assert_eq!(strm.check(), Check::Crc32);
}

#[test]
fn test_process_vec_fills_spare_capacity() {
    let mut strm = Stream::new_raw_encoder(&[Filter::Copy]).unwrap();
    let mut out = Vec::with_capacity(4);
    out.extend_from_slice(b"<");
    let mut in_pos = 0;
    let status = strm.process_vec(b"abcdef", &mut in_pos, &mut out, Action::Run).unwrap();
    assert_eq!(status, Status::Ok);
    assert_eq!(&out[..1], b"<");
    assert_eq!(&out[1..], &b"abcdef"[..out.len() - 1]);
    assert_eq!(in_pos, out.len() - 1);
}

// ── Chains ───────────────────────────────────────────────────────────────────

#[test]
fn test_zstd_round_trip() {
    let data = sample(100_000);
    let mut enc = Stream::new_raw_encoder(&[Filter::Zstd { level: 3 }]).unwrap();
    let compressed = drive(&mut enc, &data, Action::Finish);
    assert!(compressed.len() < data.len());
    assert_eq!(enc.total_out(), compressed.len() as u64);

    let mut dec = Stream::new_raw_decoder(&[Filter::Zstd { level: 3 }]).unwrap();
    assert_eq!(drive(&mut dec, &compressed, Action::Finish), data);
}

#[test]
fn test_zstd_sync_flush_is_decodable() {
    let mut enc = Stream::new_raw_encoder(&[Filter::Zstd { level: 3 }]).unwrap();
    let first = drive(&mut enc, b"the first part, ", Action::SyncFlush);
    let second = drive(&mut enc, b"and the second part", Action::Finish);

    let mut dec = Stream::new_raw_decoder(&[Filter::Zstd { level: 3 }]).unwrap();
    let mut out = vec![0u8; 256];
    let (status, read, written) = dec.process(&first, &mut out, Action::Run).unwrap();
    assert_eq!(status, Status::Ok);
    assert_eq!(read, first.len());
    assert_eq!(&out[..written], b"the first part, ");

    assert_eq!(drive(&mut dec, &second, Action::Finish), b"and the second part");
}

#[test]
fn test_truncated_zstd_frame() {
    let mut enc = Stream::new_raw_encoder(&[Filter::Zstd { level: 3 }]).unwrap();
    let compressed = drive(&mut enc, &sample(5000), Action::Finish);

    let mut dec = Stream::new_raw_decoder(&[Filter::Zstd { level: 3 }]).unwrap();
    let truncated = &compressed[..compressed.len() - 3];
    let mut in_pos = 0;
    let mut buf = vec![0u8; 8192];
    let err = loop {
        let mut out_pos = 0;
        match dec.code(truncated, &mut in_pos, &mut buf, &mut out_pos, Action::Finish) {
            Ok(Status::Ok) => continue,
            Ok(Status::StreamEnd) => panic!("truncated frame decoded"),
            Err(e) => break e,
        }
    };
    assert!(matches!(err, Error::Data(_)));
}

#[test]
fn test_multi_node_chain() {
    let filters = [Filter::Copy, Filter::Zstd { level: 1 }, Filter::Copy];
    let data = sample(20_000);

    let mut enc = Stream::new_raw_encoder(&filters).unwrap();
    let mut compressed = drive(&mut enc, &data[..7000], Action::SyncFlush);
    compressed.extend(drive(&mut enc, &data[7000..], Action::Finish));
    assert_eq!(enc.total_in(), data.len() as u64);

    let mut dec = Stream::new_raw_decoder(&filters).unwrap();
    assert_eq!(drive(&mut dec, &compressed, Action::Finish), data);
}
