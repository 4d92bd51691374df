use num_derive::{FromPrimitive, ToPrimitive};
use std::collections::HashMap;
use strum_macros::{AsRefStr, IntoStaticStr};

// see: https://dev.mysql.com/doc/refman/8.0/en/identifier-length.html
// max packet payload length.
pub const MAX_PAYLOAD_LEN: usize = 16_777_215;

pub const PACKET_HEADER_LEN: usize = 4;
/// auth-plugin-data-part-1 The first 8 bits of a random number will be used for subsequent password encryption.
/// 1 byte padding. 2-byte integer.
pub const AUTH_PLUGIN_DATA_PART_1_LENGTH: usize = 8;
/// The length of the random number required for encryption. (auth-plugin-data-part-1 + auth-plugin-data-part-2)
pub const SCRAMBLE_SIZE: usize = 20;

/// Reserved statement id meaning "the statement most recently prepared on this connection".
pub const PS_DIRECT_EXEC_ID: u32 = 0xffff_ffff;

/// AuthSwitchRequest / EOF marker byte.
pub const AUTH_SWITCH_REQUEST: u8 = 0xfe;

#[derive(Debug, PartialEq, AsRefStr, IntoStaticStr)]
pub enum AuthPluginName {
    #[strum(serialize = "mysql_old_password")]
    AuthMySQlOldPassword,
    #[strum(serialize = "caching_sha2_password")]
    AuthCachingSha2Password,
    #[strum(serialize = "sha256_password")]
    AuthSha256Password,
    #[strum(serialize = "mysql_native_password")]
    AuthNativePassword,
    #[strum(serialize = "auth_ticket_client")]
    AuthTicket,
    #[strum(serialize = "auth_unknown_plugin")]
    UnKnowPluginName,
}

#[derive(Debug, PartialEq, ToPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum HeaderInfo {
    OKHeader = 0x00,
    ErrHeader = 0xff,
    EOFHeader = 0xfe,
    LocalInFileHeader = 0xfb,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum CommandCode {
    ComSleep = 0,
    ComQuit,
    ComInitDB,
    ComQuery,
    ComFieldList,
    ComCreateDB,
    ComDropDB,
    ComRefresh,
    ComShutdown,
    ComStatistics,
    ComProcessInfo,
    ComConnect,
    ComProcessKill,
    ComDebug,
    ComPing,
    ComTime,
    ComDelayedInsert,
    ComChangeUser,
    ComBinlogDump,
    ComTableDump,
    ComConnectOut,
    ComRegisterSlave,
    ComStmtPrepare,
    ComStmtExecute,
    ComStmtSendLongData,
    ComStmtClose,
    ComStmtReset,
    ComSetOption,
    ComStmtFetch,
    ComDaemon,
    ComBinlogDumpGtid,
    ComResetConnection,
    ComEnd,
    // MariaDB extension, shares the response shape of ComStmtExecute.
    ComStmtBulkExecute = 0xfa,
}

impl CommandCode {
    /// Commands that carry SQL text in the packet payload.
    pub fn carries_statement(&self) -> bool {
        matches!(self, CommandCode::ComQuery | CommandCode::ComStmtPrepare)
    }

    /// Commands that reference a prepared statement by its 4-byte id at payload offset 1.
    pub fn is_ps_command(&self) -> bool {
        matches!(
            self,
            CommandCode::ComStmtExecute
                | CommandCode::ComStmtFetch
                | CommandCode::ComStmtSendLongData
                | CommandCode::ComStmtClose
                | CommandCode::ComStmtBulkExecute
                | CommandCode::ComStmtReset
        )
    }

    /// Whether the server answers this command at all. The reply parser only
    /// arms itself for commands in this set.
    pub fn expects_response(&self) -> bool {
        !matches!(
            self,
            CommandCode::ComQuit
                | CommandCode::ComStmtSendLongData
                | CommandCode::ComStmtClose
                | CommandCode::ComStmtFetch
        )
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct SqlComInfo;

impl SqlComInfo {
    #[inline]
    pub fn all_sql_com() -> &'static HashMap<u8, &'static str> {
        static SQL_COM: std::sync::OnceLock<HashMap<u8, &'static str>> = std::sync::OnceLock::new();
        SQL_COM.get_or_init(|| {
            HashMap::from([
                (0_u8, "ComSleep"),
                (1_u8, "ComQuit"),
                (2_u8, "ComInitDB"),
                (3_u8, "ComQuery"),
                (4_u8, "ComFieldList"),
                (5_u8, "ComCreateDB"),
                (6_u8, "ComDropDB"),
                (7_u8, "ComRefresh"),
                (8_u8, "ComShutdown"),
                (9_u8, "ComStatistics"),
                (10_u8, "ComProcessInfo"),
                (11_u8, "ComConnect"),
                (12_u8, "ComProcessKill"),
                (13_u8, "ComDebug"),
                (14_u8, "ComPing"),
                (15_u8, "ComTime"),
                (16_u8, "ComDelayedInsert"),
                (17_u8, "ComChangeUser"),
                (18_u8, "ComBinlogDump"),
                (19_u8, "ComTableDump"),
                (20_u8, "ComConnectOut"),
                (21_u8, "ComRegisterSlave"),
                (22_u8, "ComStmtPrepare"),
                (23_u8, "ComStmtExecute"),
                (24_u8, "ComStmtSendLongData"),
                (25_u8, "ComStmtClose"),
                (26_u8, "ComStmtReset"),
                (27_u8, "ComSetOption"),
                (28_u8, "ComStmtFetch"),
                (29_u8, "ComDaemon"),
                (30_u8, "ComBinlogDumpGtid"),
                (31_u8, "ComResetConnection"),
                (32_u8, "ComEnd"),
                (0xfa_u8, "ComStmtBulkExecute"),
            ])
        })
    }
}

#[cfg(test)]
mod test {
    use crate::protocol::mysql::constants::*;
    use num_traits::FromPrimitive;

    #[test]
    pub fn max_packet_size_test() {
        let max_u24_size = 16_777_215;
        assert_eq!(max_u24_size, MAX_PAYLOAD_LEN);
    }

    #[test]
    pub fn column_flag_test() {
        let enum_flag = mysql_common::constants::ColumnFlags::NOT_NULL_FLAG.bits();
        assert_eq!(1_u16, enum_flag);
    }

    #[test]
    pub fn test_common_info_code() {
        let com_info = CommandCode::ComQuery as u8;
        assert_eq!(3, com_info);
        assert_eq!(
            CommandCode::from_u8(0xfa),
            Some(CommandCode::ComStmtBulkExecute)
        );
    }

    #[test]
    pub fn test_response_convention() {
        assert!(!CommandCode::ComQuit.expects_response());
        assert!(!CommandCode::ComStmtClose.expects_response());
        assert!(!CommandCode::ComStmtSendLongData.expects_response());
        assert!(!CommandCode::ComStmtFetch.expects_response());
        assert!(CommandCode::ComQuery.expects_response());
        assert!(CommandCode::ComStmtExecute.expects_response());
    }
}
