//! L2CAP protocol constants
//!
//! Channel identifiers, signaling command codes, result codes and the timer
//! values used by the channel and link state machines.

// Fixed channel identifiers
pub const L2CAP_SIGNALING_CID: u16 = 0x0001;
pub const L2CAP_CONNECTIONLESS_CID: u16 = 0x0002;
pub const L2CAP_ATT_CID: u16 = 0x0004;
pub const L2CAP_LE_SIGNALING_CID: u16 = 0x0005;
pub const L2CAP_SMP_CID: u16 = 0x0006;

/// First dynamically allocated channel identifier
pub const L2CAP_BASE_APPL_CID: u16 = 0x0040;

// Header sizes
pub const L2CAP_PKT_OVERHEAD: usize = 4;
pub const L2CAP_CMD_OVERHEAD: usize = 4;
pub const L2CAP_SDU_LEN_OVERHEAD: usize = 2;
pub const L2CAP_FCR_OVERHEAD: usize = 2;
pub const L2CAP_FCS_LEN: usize = 2;

// Signaling command codes
pub const L2CAP_CMD_REJECT: u8 = 0x01;
pub const L2CAP_CMD_CONN_REQ: u8 = 0x02;
pub const L2CAP_CMD_CONN_RSP: u8 = 0x03;
pub const L2CAP_CMD_CONFIG_REQ: u8 = 0x04;
pub const L2CAP_CMD_CONFIG_RSP: u8 = 0x05;
pub const L2CAP_CMD_DISC_REQ: u8 = 0x06;
pub const L2CAP_CMD_DISC_RSP: u8 = 0x07;
pub const L2CAP_CMD_ECHO_REQ: u8 = 0x08;
pub const L2CAP_CMD_ECHO_RSP: u8 = 0x09;
pub const L2CAP_CMD_INFO_REQ: u8 = 0x0A;
pub const L2CAP_CMD_INFO_RSP: u8 = 0x0B;
pub const L2CAP_CMD_BLE_UPDATE_REQ: u8 = 0x12;
pub const L2CAP_CMD_BLE_UPDATE_RSP: u8 = 0x13;
pub const L2CAP_CMD_BLE_CREDIT_BASED_CONN_REQ: u8 = 0x14;
pub const L2CAP_CMD_BLE_CREDIT_BASED_CONN_RSP: u8 = 0x15;
pub const L2CAP_CMD_BLE_FLOW_CTRL_CREDIT: u8 = 0x16;

// Command reject reasons
pub const L2CAP_CMD_REJ_NOT_UNDERSTOOD: u16 = 0x0000;
pub const L2CAP_CMD_REJ_MTU_EXCEEDED: u16 = 0x0001;
pub const L2CAP_CMD_REJ_INVALID_CID: u16 = 0x0002;

// Connection results sent on the wire
pub const L2CAP_CONN_OK: u16 = 0x0000;
pub const L2CAP_CONN_PENDING: u16 = 0x0001;
pub const L2CAP_CONN_NO_PSM: u16 = 0x0002;
pub const L2CAP_CONN_SECURITY_BLOCK: u16 = 0x0003;
pub const L2CAP_CONN_NO_RESOURCES: u16 = 0x0004;

// Locally generated connection results, never sent to the peer
pub const L2CAP_CONN_NO_LINK: u16 = 0x00FF;
pub const L2CAP_CONN_TIMEOUT: u16 = 0xEEEE;

// LE credit based connection results
pub const L2CAP_LE_RESULT_CONN_OK: u16 = 0x0000;
pub const L2CAP_LE_RESULT_NO_PSM: u16 = 0x0002;
pub const L2CAP_LE_RESULT_NO_RESOURCES: u16 = 0x0004;
pub const L2CAP_LE_RESULT_INSUFFICIENT_AUTHENTICATION: u16 = 0x0005;
pub const L2CAP_LE_RESULT_INVALID_SOURCE_CID: u16 = 0x0009;
pub const L2CAP_LE_RESULT_SOURCE_CID_ALREADY_ALLOCATED: u16 = 0x000A;

// Connection status carried with a pending result
pub const L2CAP_CONN_STATUS_NONE: u16 = 0x0000;
pub const L2CAP_CONN_STATUS_AUTHENTICATION_PENDING: u16 = 0x0001;

// Disconnect confirm results
pub const L2CAP_DISC_OK: u16 = 0x0000;
pub const L2CAP_DISC_TIMEOUT: u16 = 0xEEEE;

// Configuration results
pub const L2CAP_CFG_OK: u16 = 0x0000;
pub const L2CAP_CFG_UNACCEPTABLE_PARAMS: u16 = 0x0001;
pub const L2CAP_CFG_FAILED_NO_REASON: u16 = 0x0002;
pub const L2CAP_CFG_UNKNOWN_OPTIONS: u16 = 0x0003;
pub const L2CAP_CFG_PENDING: u16 = 0x0004;

/// Continuation flag in configuration requests and responses
pub const L2CAP_CFG_FLAGS_MASK_CONT: u16 = 0x0001;

// Configuration option types
pub const L2CAP_CFG_TYPE_MTU: u8 = 0x01;
pub const L2CAP_CFG_TYPE_FLUSH_TOUT: u8 = 0x02;
pub const L2CAP_CFG_TYPE_QOS: u8 = 0x03;
pub const L2CAP_CFG_TYPE_FCR: u8 = 0x04;
pub const L2CAP_CFG_TYPE_FCS: u8 = 0x05;
pub const L2CAP_CFG_TYPE_EXT_FLOW: u8 = 0x06;
pub const L2CAP_CFG_TYPE_EXT_WIN_SIZE: u8 = 0x07;

// Option payload lengths
pub const L2CAP_CFG_MTU_OPTION_LEN: u8 = 2;
pub const L2CAP_CFG_FLUSH_OPTION_LEN: u8 = 2;
pub const L2CAP_CFG_QOS_OPTION_LEN: u8 = 22;
pub const L2CAP_CFG_FCR_OPTION_LEN: u8 = 9;
pub const L2CAP_CFG_FCS_OPTION_LEN: u8 = 1;
pub const L2CAP_CFG_EXT_FLOW_OPTION_LEN: u8 = 16;
pub const L2CAP_CFG_EXT_WIN_SIZE_LEN: u8 = 2;

// FCS option values
pub const L2CAP_CFG_FCS_BYPASS: u8 = 0x00;
pub const L2CAP_CFG_FCS_USE: u8 = 0x01;

// QoS service types
pub const NO_TRAFFIC: u8 = 0x00;
pub const BEST_EFFORT: u8 = 0x01;
pub const GUARANTEED: u8 = 0x02;

// Information request types and results
pub const L2CAP_CONNLESS_MTU_INFO_TYPE: u16 = 0x0001;
pub const L2CAP_EXTENDED_FEATURES_INFO_TYPE: u16 = 0x0002;
pub const L2CAP_FIXED_CHANNELS_INFO_TYPE: u16 = 0x0003;
pub const L2CAP_INFO_RESP_RESULT_SUCCESS: u16 = 0x0000;
pub const L2CAP_INFO_RESP_RESULT_NOT_SUPPORTED: u16 = 0x0001;

// Extended feature mask bits
pub const L2CAP_EXTFEA_ENH_RETRANS: u32 = 0x0000_0008;
pub const L2CAP_EXTFEA_STREAM_MODE: u32 = 0x0000_0010;
pub const L2CAP_EXTFEA_NO_CRC: u32 = 0x0000_0020;
pub const L2CAP_EXTFEA_EXT_FLOW_SPEC: u32 = 0x0000_0040;
pub const L2CAP_EXTFEA_FIXED_CHNLS: u32 = 0x0000_0080;
pub const L2CAP_EXTFEA_EXT_WINDOW: u32 = 0x0000_0100;

/// Features we advertise in the extended features information response
pub const L2CAP_EXTFEA_SUPPORTED_MASK: u32 = L2CAP_EXTFEA_ENH_RETRANS
    | L2CAP_EXTFEA_STREAM_MODE
    | L2CAP_EXTFEA_NO_CRC
    | L2CAP_EXTFEA_FIXED_CHNLS;

/// Fixed channels we advertise: signaling and connectionless
pub const L2CAP_FIXED_CHNL_MASK: u64 = 0x0000_0000_0000_0006;

// Channel mode option bits for the allowed-modes mask
pub const L2CAP_FCR_CHAN_OPT_BASIC: u8 = 1 << 0;
pub const L2CAP_FCR_CHAN_OPT_ERTM: u8 = 1 << 3;
pub const L2CAP_FCR_CHAN_OPT_STREAM: u8 = 1 << 4;

// MTU limits
pub const L2CAP_MIN_MTU: u16 = 48;
pub const L2CAP_DEFAULT_MTU: u16 = 672;
pub const L2CAP_MTU_SIZE: u16 = 1691;
pub const L2CAP_LE_MIN_MTU: u16 = 23;
pub const L2CAP_SIG_MTU: usize = 672;
pub const L2CAP_LE_MIN_MPS: u16 = 23;
pub const L2CAP_LE_MAX_MPS: u16 = 65533;

pub const L2CAP_DEFAULT_FLUSH_TO: u16 = 0xFFFF;
pub const L2CAP_NO_AUTOMATIC_FLUSH: u16 = 0xFFFF;

// LE credit bookkeeping
pub const L2CAP_LE_CREDIT_MAX: u16 = 0xFFFF;
pub const L2CAP_LE_CREDIT_DEFAULT: u16 = 0xFFFF;
pub const L2CAP_LE_CREDIT_THRESHOLD: u16 = 0x0040;

// ERTM timers proposed in configuration responses
pub const L2CAP_MIN_RETRANS_TOUT: u16 = 2000;
pub const L2CAP_MIN_MONITOR_TOUT: u16 = 12000;

/// Configuration attempts before the channel is disconnected
pub const L2CAP_MAX_FCR_CFG_TRIES: u8 = 2;

/// Default channel buffer quota before congestion is reported
pub const L2CAP_DEFAULT_BUFF_QUOTA: u16 = 2;

// Link timers (milliseconds)
pub const L2CAP_LINK_ROLE_SWITCH_TIMEOUT_MS: u64 = 10 * 1000;
pub const L2CAP_LINK_CONNECT_TIMEOUT_MS: u64 = 60 * 1000;
pub const L2CAP_LINK_CONNECT_EXT_TIMEOUT_MS: u64 = 120 * 1000;
pub const L2CAP_LINK_FLOW_CONTROL_TIMEOUT_MS: u64 = 2 * 1000;
pub const L2CAP_LINK_DISCONNECT_TIMEOUT_MS: u64 = 30 * 1000;
pub const L2CAP_LINK_STARTUP_TOUT_MS: u64 = 60 * 1000;
pub const L2CAP_BLE_LINK_CONNECT_TIMEOUT_MS: u64 = 30 * 1000;
pub const L2CAP_BONDING_TIMEOUT_MS: u64 = 3 * 1000;
pub const L2CAP_WAIT_INFO_RSP_TIMEOUT_MS: u64 = 3 * 1000;
pub const L2CAP_LINK_RETRY_TIMEOUT_MS: u64 = 1000;

// Channel timers (milliseconds)
pub const L2CAP_CHNL_CONNECT_TIMEOUT_MS: u64 = 60 * 1000;
pub const L2CAP_CHNL_CONNECT_EXT_TIMEOUT_MS: u64 = 120 * 1000;
pub const L2CAP_CHNL_CFG_TIMEOUT_MS: u64 = 30 * 1000;
pub const L2CAP_CHNL_DISCONNECT_TIMEOUT_MS: u64 = 10 * 1000;
pub const L2CAP_DELAY_CHECK_SM4_TIMEOUT_MS: u64 = 2 * 1000;
pub const L2CAP_FCR_ACK_TIMEOUT_MS: u64 = 200;

/// Buffer quota units granted per data rate step
pub const L2CAP_CHNL_QUOTA_PER_RATE: u16 = 100;
