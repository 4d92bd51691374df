use crate::protocol::mysql::basic::{Column, OkPacket};
use crate::protocol::mysql::charset::DEFAULT_COLLATION_ID;
use crate::protocol::mysql::constants::{AUTH_PLUGIN_DATA_PART_1_LENGTH, AUTH_SWITCH_REQUEST};
use crate::protocol::mysql::error_codes::ErrorKind;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;

use crate::server::default_capabilities;
use byteorder::{LittleEndian, WriteBytesExt};
use mysql_common::constants::{CapabilityFlags, StatusFlags};
use mysql_common::io::WriteMysqlExt;
#[cfg(feature = "tls")]
use tokio_rustls::rustls::server::ServerConfig;
use std::io::{self, Write};
use tokio::io::AsyncWrite;

/// ERR payload: 0xff, 2-byte code, '#', 5-byte SQLSTATE, message.
pub fn build_err_payload(err: ErrorKind, msg: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(9 + msg.len());
    payload.push(0xff);
    payload.extend_from_slice(&(err as u16).to_le_bytes());
    payload.push(b'#');
    payload.extend_from_slice(err.sqlstate());
    payload.extend_from_slice(msg.as_bytes());
    payload
}

/// OK payload for synthesized replies.
pub fn build_ok_payload(affected_rows: u64, last_insert_id: u64, s: StatusFlags) -> Vec<u8> {
    let mut payload = Vec::with_capacity(11);
    payload.push(0x00);
    let _ = payload.write_lenenc_int(affected_rows);
    let _ = payload.write_lenenc_int(last_insert_id);
    payload.extend_from_slice(&s.bits().to_le_bytes());
    payload.extend_from_slice(&[0x00, 0x00]); // no warnings
    payload
}

pub async fn write_err_packet<W: AsyncWrite + Unpin>(
    err: ErrorKind,
    msg: &[u8],
    w: &mut PacketWriter<W>,
) -> io::Result<()> {
    w.write_u8(0xff)?;
    w.write_u16::<LittleEndian>(err as u16)?;
    w.write_u8(b'#')?;
    w.write_all(err.sqlstate())?;
    w.write_all(msg)?;
    w.end_packet().await
}

pub async fn write_eof_packet<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
    s: StatusFlags,
) -> io::Result<()> {
    w.write_all(&[0xfe, 0x00, 0x00])?;
    w.write_u16::<LittleEndian>(s.bits())?;
    w.end_packet().await
}

pub async fn write_ok_packet<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
    rows: u64,
    last_insert_id: u64,
    s: StatusFlags,
) -> io::Result<()> {
    w.write_u8(0x00)?; // OK packet type
    w.write_lenenc_int(rows)?;
    w.write_lenenc_int(last_insert_id)?;
    w.write_u16::<LittleEndian>(s.bits())?;
    w.write_all(&[0x00, 0x00])?; // no warnings
    w.end_packet().await
}

pub async fn write_ok_packet_with_client_flags<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
    client_capabilities: CapabilityFlags,
    ok_packet: OkPacket,
) -> io::Result<()> {
    w.write_u8(ok_packet.header)?; // OK packet type
    w.write_lenenc_int(ok_packet.affected_rows)?;
    w.write_lenenc_int(ok_packet.last_insert_id)?;
    if client_capabilities.contains(CapabilityFlags::CLIENT_PROTOCOL_41) {
        w.write_u16::<LittleEndian>(ok_packet.status_flags.bits())?;
        w.write_all(&[0x00, 0x00])?; // no warnings
    } else if client_capabilities.contains(CapabilityFlags::CLIENT_TRANSACTIONS) {
        w.write_u16::<LittleEndian>(ok_packet.status_flags.bits())?;
    }

    if client_capabilities.contains(CapabilityFlags::CLIENT_SESSION_TRACK) {
        w.write_lenenc_str(ok_packet.info.as_bytes())?;
        if ok_packet
            .status_flags
            .contains(StatusFlags::SERVER_SESSION_STATE_CHANGED)
        {
            w.write_lenenc_str(ok_packet.session_state_info.as_bytes())?;
        }
    } else {
        w.write_all(ok_packet.info.as_bytes())?;
    }
    w.end_packet().await
}

pub async fn write_prepare_ok<'a, PI, CI, W>(
    id: u32,
    params: PI,
    columns: CI,
    w: &mut PacketWriter<W>,
    client_capabilities: CapabilityFlags,
) -> io::Result<()>
where
    PI: IntoIterator<Item = &'a Column>,
    CI: IntoIterator<Item = &'a Column>,
    <PI as IntoIterator>::IntoIter: ExactSizeIterator,
    <CI as IntoIterator>::IntoIter: ExactSizeIterator,
    W: AsyncWrite + Unpin,
{
    let pi = params.into_iter();
    let ci = columns.into_iter();

    // first, write out COM_STMT_PREPARE_OK
    w.write_u8(0x00)?;
    w.write_u32::<LittleEndian>(id)?;
    w.write_u16::<LittleEndian>(ci.len() as u16)?;
    w.write_u16::<LittleEndian>(pi.len() as u16)?;
    w.write_u8(0x00)?;
    w.write_u16::<LittleEndian>(0)?; // number of warnings
    w.end_packet().await?;

    if pi.len() > 0 {
        write_column_definitions_41(pi, w, client_capabilities, false).await?;
    }
    if ci.len() > 0 {
        write_column_definitions_41(ci, w, client_capabilities, false).await?;
    }
    Ok(())
}

pub async fn write_column_definitions<'a, I, W>(
    i: I,
    w: &mut PacketWriter<W>,
    client_capabilities: CapabilityFlags,
) -> io::Result<()>
where
    I: IntoIterator<Item = &'a Column>,
    <I as IntoIterator>::IntoIter: ExactSizeIterator,
    W: AsyncWrite + Unpin,
{
    let i = i.into_iter();
    w.write_lenenc_int(i.len() as u64)?;
    w.end_packet().await?;
    write_column_definitions_41(i, w, client_capabilities, false).await
}

// works for Protocol::ColumnDefinition41 is set
// see: https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_com_query_response_text_resultset_column_definition.html
pub async fn write_column_definitions_41<'a, I, W>(
    i: I,
    w: &mut PacketWriter<W>,
    client_capabilities: CapabilityFlags,
    is_com_field_list: bool,
) -> io::Result<()>
where
    I: IntoIterator<Item = &'a Column>,
    W: AsyncWrite + Unpin,
{
    for c in i {
        w.write_lenenc_str(b"def")?;
        w.write_lenenc_str(b"")?;
        w.write_lenenc_str(c.table.as_bytes())?;
        w.write_lenenc_str(b"")?;
        w.write_lenenc_str(c.column.as_bytes())?;
        w.write_lenenc_str(b"")?;
        w.write_lenenc_int(0xC)?;
        w.write_u16::<LittleEndian>(33)?;
        w.write_u32::<LittleEndian>(1024)?;
        w.write_u8(c.column_type as u8)?;
        w.write_u16::<LittleEndian>(c.column_flags.bits())?;
        w.write_all(&[0x00])?; // decimals
        w.write_all(&[0x00, 0x00])?; // unused

        if is_com_field_list {
            w.write_all(&[0xfb])?;
        }
        w.end_packet().await?;
    }

    if !client_capabilities.contains(CapabilityFlags::CLIENT_DEPRECATE_EOF) {
        write_eof_packet(w, StatusFlags::empty()).await
    } else {
        Ok(())
    }
}

/// AuthSwitchRequest: 0xfe, mechanism name, NUL, plugin data, NUL.
/// The native mechanism sends its scramble as plugin data; the ticket
/// mechanism sends the service principal identifier.
pub async fn write_auth_switch_request<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
    plugin_name: &str,
    plugin_data: &[u8],
) -> io::Result<()> {
    w.write_u8(AUTH_SWITCH_REQUEST)?;
    w.write_all(plugin_name.as_bytes())?;
    w.write_all(&[0x00])?;
    w.write_all(plugin_data)?;
    w.write_all(&[0x00])?;
    w.end_packet().await?;
    w.flush_all().await
}

pub async fn write_initial_handshake<W: AsyncWrite + Unpin>(
    writer: &mut PacketWriter<W>,
    conn_id: u64,
    scramble: [u8; 20],
    server_version: &[u8],
    auth_plugin: &str,
    #[cfg(feature = "tls")] tls_conf: &Option<std::sync::Arc<ServerConfig>>,
) -> io::Result<()> {
    writer.write_all(&[10])?; // protocol 10

    writer.write_all(server_version)?;
    writer.write_all(&[0x00])?;
    // connection_id (4 bytes)
    let conn_id_bytes = &[
        conn_id as u8,
        (conn_id >> 8) as u8,
        (conn_id >> 16) as u8,
        (conn_id >> 24) as u8,
    ];
    writer.write_all(conn_id_bytes)?;
    let server_capabilities = default_capabilities();
    #[cfg(feature = "tls")]
    let server_capabilities = if tls_conf.is_some() {
        server_capabilities | CapabilityFlags::CLIENT_SSL
    } else {
        server_capabilities
    };
    let server_capabilities_vec = server_capabilities.bits().to_le_bytes();

    writer.write_all(&scramble[0..AUTH_PLUGIN_DATA_PART_1_LENGTH])?; // auth-plugin-data-part-1
    writer.write_all(&[0x00])?;

    writer.write_all(&server_capabilities_vec[..2])?; // The lower 2 bytes of the Capabilities Flags

    writer.write_all(&DEFAULT_COLLATION_ID.to_le_bytes())?; // utf8_general_ci
    writer.write_all(&StatusFlags::SERVER_STATUS_AUTOCOMMIT.bits().to_le_bytes())?; // status_flags
    writer.write_all(&server_capabilities_vec[2..4])?; // The upper 2 bytes of the Capabilities Flags

    writer.write_all(&((scramble.len() + 1) as u8).to_le_bytes())?;

    writer.write_all(&[0x00; 10][..])?; // 10 bytes filler
                                        // Part2 of the auth_plugin_data
                                        // $len=MAX(13, length of auth-plugin-data - 8)
    writer.write_all(&scramble[AUTH_PLUGIN_DATA_PART_1_LENGTH..])?; // 12 bytes
    writer.write_all(&[0x00])?;

    // Plugin name
    writer.write_all(auth_plugin.as_bytes())?;
    writer.write_all(&[0x00])?;
    writer.end_packet().await?;
    writer.flush_all().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufChain;
    use crate::protocol::mysql::basic::ok_packet;
    use crate::protocol::mysql::packet::next_packet;

    #[test]
    fn test_err_payload_shape() {
        let payload = build_err_payload(ErrorKind::ER_ACCESS_DENIED_ERROR, "Access denied");
        assert_eq!(payload[0], 0xff);
        assert_eq!(u16::from_le_bytes([payload[1], payload[2]]), 1045);
        assert_eq!(payload[3], b'#');
        assert_eq!(&payload[4..9], b"28000");
        assert_eq!(&payload[9..], b"Access denied");
    }

    #[test]
    fn test_ok_payload_parses_back() {
        let payload = build_ok_payload(3, 0, StatusFlags::SERVER_STATUS_AUTOCOMMIT);
        let (_, ok) = ok_packet(&payload, default_capabilities()).unwrap();
        assert_eq!(ok.affected_rows, 3);
        assert!(ok
            .status_flags
            .contains(StatusFlags::SERVER_STATUS_AUTOCOMMIT));
    }

    #[tokio::test]
    async fn test_auth_switch_request_layout() {
        let mut out = Vec::new();
        {
            let mut writer = PacketWriter::new(&mut out);
            writer.set_seq(2);
            write_auth_switch_request(&mut writer, "auth_ticket_client", b"mariadb/principal")
                .await
                .unwrap();
        }
        let mut queue = BufChain::from_vec(out);
        let (seq, pkt) = next_packet(&mut queue, None).unwrap().unwrap();
        assert_eq!(seq, 2);
        let payload = pkt.contiguous();
        assert_eq!(payload[0], 0xfe);
        let name_end = payload[1..].iter().position(|&b| b == 0).unwrap() + 1;
        assert_eq!(&payload[1..name_end], b"auth_ticket_client");
    }
}
