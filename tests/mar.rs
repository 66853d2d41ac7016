/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::{
    fs,
    io::{Cursor, Read},
    path::Path,
};

use mar::{
    add_signature_block,
    format::{
        write_header, write_index, ExtraSection, ExtrasBlock, Layout, MarFileInfo, MarItem,
        ProductInfo, SignatureBlock, HEADER_SIZE,
    },
    signing::{load_private_key, make_rsa_keypair, sign_hash},
    Compression, Decompression, Mar, MarError, MarWriter, MarWriterOptions, SignatureType,
    SigningAlgorithm,
};

fn write_tree(root: &Path) {
    fs::create_dir_all(root.join("dir/sub")).unwrap();
    fs::write(root.join("top.txt"), b"top level").unwrap();
    fs::write(root.join("dir/a.txt"), "a".repeat(10000)).unwrap();
    fs::write(root.join("dir/sub/b.bin"), (0..=255u8).collect::<Vec<_>>()).unwrap();
    fs::write(root.join("dir/sub/empty"), b"").unwrap();
}

fn signed_mar(private_pem: &str, files: &[(&str, &[u8])]) -> Cursor<Vec<u8>> {
    let options = MarWriterOptions::new()
        .product_version("99.9")
        .channel("release")
        .signing_key(private_pem);
    let mut writer = MarWriter::new(Cursor::new(Vec::new()), options).unwrap();
    for (name, data) in files {
        writer
            .add_stream(*data, name, Compression::None, 0o644)
            .unwrap();
    }
    writer.finish().unwrap()
}

#[test]
fn round_trip_directories() {
    for compression in [Compression::None, Compression::Bz2, Compression::Xz] {
        let src = tempfile::tempdir().unwrap();
        write_tree(src.path());

        let marfile = src.path().join("test.mar");
        let options = MarWriterOptions::new()
            .product_version("99.9")
            .channel("release");
        let mut writer = MarWriter::create(&marfile, options).unwrap();
        writer.add(src.path().join("top.txt"), compression).unwrap();
        writer.add(src.path().join("dir"), compression).unwrap();
        writer.finish().unwrap();

        let mut mar = Mar::from_path(&marfile).unwrap();
        assert!(mar.errors().is_empty(), "{:?}", mar.errors());

        let names: Vec<_> = mar.files().map(|item| item.name.clone()).collect();
        assert_eq!(names.len(), 4);
        assert!(names[0].ends_with("/top.txt"));
        assert!(names[1].ends_with("/dir/a.txt"));
        assert!(names[2].ends_with("/dir/sub/b.bin"));
        assert!(names[3].ends_with("/dir/sub/empty"));
        assert!(names.iter().all(|name| !name.contains('\\')));

        let expected = match compression {
            Compression::None => None,
            other => Some(other),
        };
        assert_eq!(mar.compression_type().unwrap(), expected);

        let dest = tempfile::tempdir().unwrap();
        mar.extract(dest.path(), Decompression::Auto).unwrap();
        let originals = ["top.txt", "dir/a.txt", "dir/sub/b.bin", "dir/sub/empty"];
        for (name, original) in names.iter().zip(originals) {
            assert_eq!(
                fs::read(dest.path().join(name)).unwrap(),
                fs::read(src.path().join(original)).unwrap(),
                "{} with {}",
                name,
                compression
            );
        }
    }
}

#[cfg(unix)]
#[test]
fn keeps_permissions() {
    use std::os::unix::fs::PermissionsExt;

    let src = tempfile::tempdir().unwrap();
    let script = src.path().join("run.sh");
    fs::write(&script, b"#!/bin/sh\n").unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o750)).unwrap();

    let mut writer = MarWriter::new(Cursor::new(Vec::new()), MarWriterOptions::new()).unwrap();
    writer.add_file(&script, Compression::Bz2).unwrap();
    let mar = Mar::from_buffer(writer.finish().unwrap()).unwrap();
    assert_eq!(mar.files().next().unwrap().flags, 0o750);
}

#[test]
fn add_file_rejects_directories() {
    let src = tempfile::tempdir().unwrap();
    let mut writer = MarWriter::new(Cursor::new(Vec::new()), MarWriterOptions::new()).unwrap();
    assert!(matches!(
        writer.add_file(src.path(), Compression::None),
        Err(MarError::Usage(_))
    ));
}

#[test]
fn format_follows_product_info() {
    let old = MarWriter::new(Cursor::new(Vec::new()), MarWriterOptions::new())
        .unwrap()
        .finish()
        .unwrap();
    let mar = Mar::from_buffer(old).unwrap();
    assert_eq!(mar.info().layout, Layout::Old);
    assert!(mar.info().signatures().is_none());
    assert_eq!(mar.info().data_offset, 8);

    let options = MarWriterOptions::new()
        .product_version("99.9")
        .channel("release");
    let mut writer = MarWriter::new(Cursor::new(Vec::new()), options).unwrap();
    writer
        .add_stream(&b"hello world"[..], "message.txt", Compression::None, 0o644)
        .unwrap();
    let mar = Mar::from_buffer(writer.finish().unwrap()).unwrap();
    assert!(matches!(mar.info().layout, Layout::New { .. }));
    assert!(mar.info().data_offset > 8);
    assert_eq!(mar.info().offset_additional_blocks(), Some(20));
}

#[test]
fn sha1_signatures() {
    let (private_pem, public_pem) = make_rsa_keypair(2048).unwrap();
    let (_, other_public) = make_rsa_keypair(2048).unwrap();

    let buf = signed_mar(&private_pem, &[("message.txt", b"hello world")]);
    let filesize = buf.get_ref().len() as u64;
    let mut mar = Mar::from_buffer(buf).unwrap();

    let sigs = mar.info().signatures().unwrap().clone();
    assert_eq!(sigs.filesize, filesize);
    assert_eq!(sigs.signatures.len(), 1);
    assert_eq!(sigs.signatures[0].algorithm_id, 1);
    assert_eq!(sigs.signatures[0].signature.len(), 256);
    assert_eq!(
        mar.signature_type(),
        Some(SignatureType::Known(SigningAlgorithm::Sha1))
    );

    assert!(mar.verify(public_pem.as_bytes()).unwrap());
    assert!(mar.verify(private_pem.as_bytes()).unwrap());
    assert!(!mar.verify(other_public.as_bytes()).unwrap());
}

#[test]
fn tampering_breaks_signature() {
    let (private_pem, public_pem) = make_rsa_keypair(2048).unwrap();
    let buf = signed_mar(&private_pem, &[("message.txt", b"hello world")]);

    let mar = Mar::from_buffer(buf).unwrap();
    let info = mar.info().clone();
    let original = mar.into_inner().into_inner();

    let extras = info.offset_additional_blocks().unwrap() as usize;
    let regions = [
        // header, filesize, count, then the first signature's id and size
        ("signature", 8 + 8 + 4 + 8),
        // extras count, section size and id, then the channel name
        ("extras", extras + 12),
        ("data", info.entries[0].offset as usize),
        // index size, then the first entry's offset and length
        ("index", info.offset_to_index as usize + 4 + 8),
    ];

    for (region, offset) in regions {
        let mut data = original.clone();
        data[offset] ^= 0x01;
        let mut mar = Mar::from_buffer(Cursor::new(data)).unwrap();
        assert!(!mar.verify(public_pem.as_bytes()).unwrap(), "{}", region);
    }

    let mut mar = Mar::from_buffer(Cursor::new(original)).unwrap();
    assert!(mar.verify(public_pem.as_bytes()).unwrap());
}

#[test]
fn unsigned_files_never_verify() {
    let (_, public_pem) = make_rsa_keypair(2048).unwrap();
    let options = MarWriterOptions::new()
        .product_version("99.9")
        .channel("release");
    let buf = MarWriter::new(Cursor::new(Vec::new()), options)
        .unwrap()
        .finish()
        .unwrap();
    let mut mar = Mar::from_buffer(buf).unwrap();
    assert!(!mar.verify(public_pem.as_bytes()).unwrap());
}

#[test]
fn detached_signing() {
    let (private_pem, public_pem) = make_rsa_keypair(2048).unwrap();
    let key = load_private_key(private_pem.as_bytes()).unwrap();

    let mut writer = MarWriter::new(Cursor::new(Vec::new()), MarWriterOptions::new()).unwrap();
    writer
        .add_stream(&b"hello world"[..], "message.txt", Compression::Xz, 0o644)
        .unwrap();
    let mut unsigned = writer.finish().unwrap();

    // Hash a copy carrying a placeholder, sign the hash, then inject it.
    let mut placeholder = Cursor::new(Vec::new());
    add_signature_block(&mut unsigned, &mut placeholder, SigningAlgorithm::Sha1, None).unwrap();
    let mut mar = Mar::from_buffer(placeholder).unwrap();
    let hashes = mar.calculate_hashes().unwrap();
    assert_eq!(hashes.len(), 1);
    assert_eq!(hashes[0].0, 1);
    let signature = sign_hash(&key, SigningAlgorithm::Sha1, &hashes[0].1).unwrap();
    assert!(!mar.verify(public_pem.as_bytes()).unwrap());

    let mut signed = Cursor::new(Vec::new());
    add_signature_block(
        &mut unsigned,
        &mut signed,
        SigningAlgorithm::Sha1,
        Some(&signature),
    )
    .unwrap();

    let mut mar = Mar::from_buffer(signed).unwrap();
    assert_eq!(mar.calculate_hashes().unwrap(), hashes);
    assert!(mar.verify(public_pem.as_bytes()).unwrap());

    let item = mar.files().next().unwrap().clone();
    let mut out = Vec::new();
    mar.read_entry(&item, Decompression::Auto)
        .unwrap()
        .read_to_end(&mut out)
        .unwrap();
    assert_eq!(out, b"hello world");

    // Re-signing a signed file gives the same digest.
    let mut resigned = Cursor::new(Vec::new());
    let mut signed = mar.into_inner();
    add_signature_block(&mut signed, &mut resigned, SigningAlgorithm::Sha1, None).unwrap();
    let mut mar = Mar::from_buffer(resigned).unwrap();
    assert_eq!(mar.calculate_hashes().unwrap(), hashes);
}

/// A new format file with product info padding and an unknown section, as
/// written by other tools.
fn new_format_with_extras() -> (Vec<u8>, ExtrasBlock) {
    let sigs = SignatureBlock {
        filesize: 0,
        signatures: Vec::new(),
    };
    let extras = ExtrasBlock {
        sections: vec![
            ExtraSection::ProductInfo(ProductInfo {
                channel: "release".to_owned(),
                product_version: "99.9".to_owned(),
                padding: vec![7, 0, 9],
            }),
            ExtraSection::Unknown {
                id: 5,
                data: b"xyz".to_vec(),
            },
        ],
    };
    let data = b"hello worldgoodbye";
    let data_offset = (HEADER_SIZE as usize + sigs.encoded_len() + extras.encoded_len()) as u32;

    let mut buf = Vec::new();
    write_header(&mut buf, data_offset + data.len() as u32).unwrap();
    sigs.write_to(&mut buf).unwrap();
    extras.write_to(&mut buf).unwrap();
    buf.extend_from_slice(data);
    write_index(
        &mut buf,
        &[
            MarItem {
                offset: data_offset,
                length: 11,
                flags: 0o644,
                name: "hello.txt".to_owned(),
            },
            MarItem {
                offset: data_offset + 11,
                length: 7,
                flags: 0o600,
                name: "bye.txt".to_owned(),
            },
        ],
    )
    .unwrap();
    (buf, extras)
}

/// Everything between the signature block and the index.
fn extras_and_data<'a>(buf: &'a [u8], info: &MarFileInfo) -> &'a [u8] {
    let start = info.offset_additional_blocks().unwrap() as usize;
    &buf[start..info.offset_to_index as usize]
}

#[test]
fn re_signing_keeps_extras_and_data() {
    let (private_pem, public_pem) = make_rsa_keypair(2048).unwrap();
    let key = load_private_key(private_pem.as_bytes()).unwrap();

    let (original, extras) = new_format_with_extras();
    let source = Mar::from_buffer(Cursor::new(original.clone())).unwrap();
    assert_eq!(source.info().extras(), Some(&extras));
    let source_info = source.info().clone();

    let mut placeholder = Cursor::new(Vec::new());
    add_signature_block(
        &mut Cursor::new(original.clone()),
        &mut placeholder,
        SigningAlgorithm::Sha1,
        None,
    )
    .unwrap();
    let hashes = Mar::from_buffer(placeholder)
        .unwrap()
        .calculate_hashes()
        .unwrap();
    let signature = sign_hash(&key, SigningAlgorithm::Sha1, &hashes[0].1).unwrap();

    let mut signed = Cursor::new(Vec::new());
    add_signature_block(
        &mut Cursor::new(original.clone()),
        &mut signed,
        SigningAlgorithm::Sha1,
        Some(&signature),
    )
    .unwrap();
    let signed = signed.into_inner();

    let mut mar = Mar::from_buffer(Cursor::new(signed.clone())).unwrap();
    assert!(mar.verify(public_pem.as_bytes()).unwrap());
    let info = mar.info().clone();

    assert_eq!(info.extras(), Some(&extras));
    assert_eq!(
        extras_and_data(&signed, &info),
        extras_and_data(&original, &source_info)
    );

    // Only the entry offsets move, by the size of the new signature.
    let delta = info.data_offset - source_info.data_offset;
    assert_eq!(delta, 8 + 256);
    assert_eq!(info.entries.len(), source_info.entries.len());
    for (after, before) in info.entries.iter().zip(&source_info.entries) {
        assert_eq!(after.offset, before.offset + delta);
        assert_eq!(after.length, before.length);
        assert_eq!(after.flags, before.flags);
        assert_eq!(after.name, before.name);
    }
    assert_eq!(info.signatures().unwrap().filesize, signed.len() as u64);
}

#[test]
fn sha384_signatures() {
    let (private_pem, public_pem) = make_rsa_keypair(4096).unwrap();
    let (small_private, small_public) = make_rsa_keypair(2048).unwrap();

    let mut mar = Mar::from_buffer(signed_mar(&private_pem, &[("a", b"aaaa"), ("b", b"bbbb")]))
        .unwrap();
    let sigs = mar.info().signatures().unwrap().clone();
    assert_eq!(sigs.signatures[0].algorithm_id, 2);
    assert_eq!(sigs.signatures[0].signature.len(), 512);
    assert!(mar.verify(public_pem.as_bytes()).unwrap());
    assert!(!mar.verify(small_public.as_bytes()).unwrap());

    let options = MarWriterOptions::new()
        .product_version("99.9")
        .channel("release")
        .signing_key(small_private)
        .signing_algorithm(SigningAlgorithm::Sha384);
    assert!(matches!(
        MarWriter::new(Cursor::new(Vec::new()), options),
        Err(MarError::KeySizeMismatch {
            expected: 4096,
            actual: 2048
        })
    ));
}
