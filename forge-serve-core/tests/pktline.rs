use forge_serve_core::pktline::{advertisement_preamble, write_flush, write_service_header};
use forge_serve_core::{ProtocolVersion, ServiceKind};
use pretty_assertions::assert_eq;

#[test]
fn flush_is_four_zeros() {
    let mut out = Vec::new();
    write_flush(&mut out).unwrap();
    assert_eq!(&out, b"0000");
}

#[test]
fn receive_pack_service_header() {
    let mut out = Vec::new();
    write_service_header(&mut out, ServiceKind::ReceivePack).unwrap();
    assert_eq!(
        String::from_utf8(out).unwrap(),
        "001f# service=git-receive-pack\n0000"
    );
}

#[test]
fn upload_pack_service_header() {
    let out = advertisement_preamble(ServiceKind::UploadPack, ProtocolVersion::V0).unwrap();
    assert_eq!(String::from_utf8(out).unwrap(), "001e# service=git-upload-pack\n0000");
}

#[test]
fn v2_clients_get_no_preamble() {
    let out = advertisement_preamble(ServiceKind::UploadPack, ProtocolVersion::V2).unwrap();
    assert!(out.is_empty());
}
