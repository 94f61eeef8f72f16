//! pkt-line framing needed by the smart HTTP `info/refs` endpoint.
//!
//! `git <service> --stateless-rpc --advertise-refs` does not emit the
//! `# service=<name>` preamble the HTTP transport requires, so it is written here.

use gix_packetline_blocking as pkt;

use crate::protocol::ProtocolVersion;
use crate::service::ServiceKind;

/// Write a flush packet.
pub fn write_flush(out: &mut impl std::io::Write) -> std::io::Result<()> {
    pkt::encode::flush_to_write(out).map(|_| ())
}

/// Write a single data line.
pub fn write_data(out: &mut impl std::io::Write, data: &[u8]) -> std::io::Result<()> {
    pkt::encode::data_to_write(data, out).map(|_| ())
}

/// Write the `# service=git-<svc>` header followed by a flush packet.
pub fn write_service_header(out: &mut impl std::io::Write, service: ServiceKind) -> std::io::Result<()> {
    write_data(out, format!("# service={}\n", service.name()).as_bytes())?;
    write_flush(out)
}

/// Produce the advertisement preamble for `service`, which is empty for protocol v2 clients.
pub fn advertisement_preamble(service: ServiceKind, version: ProtocolVersion) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if version != ProtocolVersion::V2 {
        write_service_header(&mut buf, service)?;
    }
    Ok(buf)
}
