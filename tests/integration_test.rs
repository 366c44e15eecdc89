use lzcore::index::{IndexDecoder, STREAM_HEADER_SIZE};
use lzcore::{Action, ChainConfig, Filter, Index, Status, Stream, SubblockOptions, SubfilterCommand};

const HEADER: [u8; 12] = *b"LZCORE\0\0HDR\0";
const FOOTER: [u8; 12] = *b"LZCORE\0\0FTR\0";

/// Push `input` through `strm` and collect everything it produces.
fn run(strm: &mut Stream, input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() / 2 + 64);
    let mut in_pos = 0;
    loop {
        if out.len() == out.capacity() {
            out.reserve(4096);
        }
        if strm.process_vec(input, &mut in_pos, &mut out, Action::Finish).unwrap() == Status::StreamEnd {
            return out;
        }
    }
}

/// Lay out one Stream: header, Blocks padded to four bytes, Index, footer.
fn write_stream(config: &ChainConfig, blocks: &[&[u8]]) -> (Vec<u8>, Index) {
    let mut file = HEADER.to_vec();
    let mut index = Index::new();
    for block in blocks {
        let mut strm = config.encoder().unwrap();
        let compressed = run(&mut strm, block);
        index.append(compressed.len() as u64, block.len() as u64).unwrap();
        file.extend_from_slice(&compressed);
        file.resize(file.len().next_multiple_of(4), 0);
    }
    let mut strm = Stream::new_index_encoder(index.clone()).unwrap();
    file.extend(run(&mut strm, &[]));
    file.extend_from_slice(&FOOTER);
    (file, index)
}

fn read_index(config: &ChainConfig, bytes: &[u8]) -> Index {
    let mut strm = config.index_decoder().unwrap();
    let (status, read, _) = strm.process(bytes, &mut [], Action::Finish).unwrap();
    assert_eq!(status, Status::StreamEnd);
    assert_eq!(read, bytes.len());
    strm.coder_mut::<IndexDecoder>().unwrap().take_index().unwrap()
}

fn blocks() -> Vec<Vec<u8>> {
    vec![
        b"first block: plain text that compresses a little".repeat(20),
        Vec::new(),
        (0..5000u32).map(|i| (i * 7 % 256) as u8).collect(),
        vec![b'z'; 9000],
    ]
}

#[test]
fn test_stream_layout_and_random_access() {
    let config = ChainConfig::from_bytes(
        br#"{
            "filters": [
                { "type": "subblock", "rle": 1 },
                { "type": "zstd", "level": 5 }
            ],
            "memlimit": 1048576
        }"#,
    )
    .unwrap();
    config.validate().unwrap();

    let blocks = blocks();
    let slices: Vec<&[u8]> = blocks.iter().map(Vec::as_slice).collect();
    let (file, index) = write_stream(&config, &slices);
    assert_eq!(index.stream_size(), file.len() as u64);
    assert_eq!(index.file_size(), file.len() as u64);

    // The Index sits between the last Block and the footer.
    let index_start = file.len() - STREAM_HEADER_SIZE as usize - index.size() as usize;
    let mut decoded = read_index(&config, &file[index_start..file.len() - FOOTER.len()]);
    assert_eq!(decoded, index);

    let mut offset = 0;
    for block in &blocks {
        if block.is_empty() {
            continue;
        }
        for probe in [offset, offset + block.len() as u64 / 2, offset + block.len() as u64 - 1] {
            let record = decoded.locate(probe).unwrap();
            assert_eq!(record.uncompressed_offset, offset);

            let start = (STREAM_HEADER_SIZE + record.stream_offset) as usize;
            let compressed = &file[start..start + record.unpadded_size as usize];
            let mut strm = config.decoder().unwrap();
            assert_eq!(&run(&mut strm, compressed), block);
        }
        offset += block.len() as u64;
    }
    assert_eq!(decoded.locate(offset), None);
}

#[test]
fn test_concatenated_streams() {
    let config = ChainConfig::new(vec![Filter::Zstd { level: 1 }]);
    let blocks = blocks();

    let (mut file, mut first) = write_stream(&config, &[blocks[0].as_slice(), blocks[2].as_slice()]);
    let padding = 8;
    file.resize(file.len() + padding, 0);
    let (second_file, second) = write_stream(&config, &[blocks[3].as_slice()]);
    file.extend_from_slice(&second_file);

    first.cat(second, padding as u64).unwrap();
    assert_eq!(first.file_size(), file.len() as u64);
    assert_eq!(first.count(), 3);

    // Every record points at a Block that decodes to its recorded size.
    first.rewind();
    let mut seen = 0;
    while let Some(record) = first.read() {
        let start = (STREAM_HEADER_SIZE + record.stream_offset) as usize;
        let compressed = &file[start..start + record.unpadded_size as usize];
        let mut strm = config.decoder().unwrap();
        assert_eq!(run(&mut strm, compressed).len() as u64, record.uncompressed_size);
        seen += 1;
    }
    assert_eq!(seen, 3);

    let last = first.locate(first.uncompressed_size() - 1).unwrap();
    assert_eq!(last.uncompressed_size, blocks[3].len() as u64);
}

#[test]
fn test_config_survives_storage() {
    let config = ChainConfig {
        filters:  vec![
            Filter::Subblock(SubblockOptions { allow_subfilters: true, alignment: 8, ..Default::default() }),
            Filter::Copy,
        ],
        memlimit: None,
    };
    let stored = config.to_bytes().unwrap();
    let restored = ChainConfig::from_bytes(&stored).unwrap();
    assert_eq!(restored, config);

    let data = b"configuration-driven payload with a nested part".repeat(10);
    let mut enc = config.encoder().unwrap();
    enc.subfilter(SubfilterCommand::Set(Filter::Zstd { level: 3 })).unwrap();
    let encoded = run(&mut enc, &data);

    let mut dec = restored.decoder().unwrap();
    assert_eq!(run(&mut dec, &encoded), data);
}

#[test]
fn test_index_memlimit_from_config() {
    let config = ChainConfig { filters: vec![Filter::Copy], memlimit: Some(1) };
    let mut index = Index::new();
    index.append(16, 100).unwrap();
    let mut strm = Stream::new_index_encoder(index).unwrap();
    let bytes = run(&mut strm, &[]);

    let mut dec = config.index_decoder().unwrap();
    let err = dec.process(&bytes, &mut [], Action::Run).unwrap_err();
    assert!(err.is_recoverable());
}
