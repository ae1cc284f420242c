//! L2CAP Signaling channel codec
//!
//! Parses and serializes the commands carried on the BR/EDR signaling
//! channel (CID 0x0001) and the LE signaling channel (CID 0x0005):
//!
//! - connection, configuration and disconnection requests and responses
//! - echo and information requests and responses
//! - LE credit based connection setup and flow control credits
//! - command reject
//!
//! Configuration options are decoded into [`ConfigInfo`]. Unknown options
//! without the hint bit are kept verbatim so the caller can reject them.

use super::constants::*;
use super::packet::L2capCommandHeader;
use super::types::*;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// Handle for identifying signaling transactions
pub type SignalId = u8;

/// Option type bit marking an option the receiver may skip
const L2CAP_CFG_OPTION_HINT: u8 = 0x80;

/// L2CAP Signaling message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    CommandReject {
        identifier: SignalId,
        reason: u16,
        data: Vec<u8>,
    },

    ConnectionRequest {
        identifier: SignalId,
        psm: u16,
        source_cid: u16,
    },

    ConnectionResponse {
        identifier: SignalId,
        destination_cid: u16,
        source_cid: u16,
        result: u16,
        status: u16,
    },

    /// `config.result` is unused on requests.
    ConfigureRequest {
        identifier: SignalId,
        destination_cid: u16,
        config: ConfigInfo,
        unknown_options: Vec<u8>,
    },

    ConfigureResponse {
        identifier: SignalId,
        source_cid: u16,
        config: ConfigInfo,
        unknown_options: Vec<u8>,
    },

    DisconnectionRequest {
        identifier: SignalId,
        destination_cid: u16,
        source_cid: u16,
    },

    DisconnectionResponse {
        identifier: SignalId,
        destination_cid: u16,
        source_cid: u16,
    },

    EchoRequest {
        identifier: SignalId,
        data: Vec<u8>,
    },

    EchoResponse {
        identifier: SignalId,
        data: Vec<u8>,
    },

    InformationRequest {
        identifier: SignalId,
        info_type: u16,
    },

    InformationResponse {
        identifier: SignalId,
        info_type: u16,
        result: u16,
        data: Vec<u8>,
    },

    LeCreditBasedConnectionRequest {
        identifier: SignalId,
        le_psm: u16,
        source_cid: u16,
        mtu: u16,
        mps: u16,
        initial_credits: u16,
    },

    LeCreditBasedConnectionResponse {
        identifier: SignalId,
        destination_cid: u16,
        mtu: u16,
        mps: u16,
        initial_credits: u16,
        result: u16,
    },

    LeFlowControlCredit {
        identifier: SignalId,
        cid: u16,
        credits: u16,
    },
}

fn truncated(_: std::io::Error) -> L2capError {
    L2capError::MalformedSignaling("truncated parameters".into())
}

fn bad_option(option_type: u8, length: u8) -> L2capError {
    L2capError::MalformedSignaling(format!(
        "config option 0x{:02X} with bad length {}",
        option_type, length
    ))
}

impl SignalingMessage {
    pub fn identifier(&self) -> SignalId {
        match self {
            Self::CommandReject { identifier, .. }
            | Self::ConnectionRequest { identifier, .. }
            | Self::ConnectionResponse { identifier, .. }
            | Self::ConfigureRequest { identifier, .. }
            | Self::ConfigureResponse { identifier, .. }
            | Self::DisconnectionRequest { identifier, .. }
            | Self::DisconnectionResponse { identifier, .. }
            | Self::EchoRequest { identifier, .. }
            | Self::EchoResponse { identifier, .. }
            | Self::InformationRequest { identifier, .. }
            | Self::InformationResponse { identifier, .. }
            | Self::LeCreditBasedConnectionRequest { identifier, .. }
            | Self::LeCreditBasedConnectionResponse { identifier, .. }
            | Self::LeFlowControlCredit { identifier, .. } => *identifier,
        }
    }

    pub fn command_code(&self) -> u8 {
        match self {
            Self::CommandReject { .. } => L2CAP_CMD_REJECT,
            Self::ConnectionRequest { .. } => L2CAP_CMD_CONN_REQ,
            Self::ConnectionResponse { .. } => L2CAP_CMD_CONN_RSP,
            Self::ConfigureRequest { .. } => L2CAP_CMD_CONFIG_REQ,
            Self::ConfigureResponse { .. } => L2CAP_CMD_CONFIG_RSP,
            Self::DisconnectionRequest { .. } => L2CAP_CMD_DISC_REQ,
            Self::DisconnectionResponse { .. } => L2CAP_CMD_DISC_RSP,
            Self::EchoRequest { .. } => L2CAP_CMD_ECHO_REQ,
            Self::EchoResponse { .. } => L2CAP_CMD_ECHO_RSP,
            Self::InformationRequest { .. } => L2CAP_CMD_INFO_REQ,
            Self::InformationResponse { .. } => L2CAP_CMD_INFO_RSP,
            Self::LeCreditBasedConnectionRequest { .. } => L2CAP_CMD_BLE_CREDIT_BASED_CONN_REQ,
            Self::LeCreditBasedConnectionResponse { .. } => L2CAP_CMD_BLE_CREDIT_BASED_CONN_RSP,
            Self::LeFlowControlCredit { .. } => L2CAP_CMD_BLE_FLOW_CTRL_CREDIT,
        }
    }

    /// Parse configuration options, returning the decoded options and the
    /// raw bytes of every unknown option that is not a hint.
    fn parse_config_options(data: &[u8], config: &mut ConfigInfo) -> L2capResult<Vec<u8>> {
        let mut unknown = Vec::new();
        let mut offset = 0;

        while offset + 2 <= data.len() {
            let option_type = data[offset];
            let option_length = data[offset + 1];
            let start = offset + 2;
            let end = start + option_length as usize;

            if end > data.len() {
                return Err(bad_option(option_type, option_length));
            }

            let option_data = &data[start..end];
            let mut cursor = Cursor::new(option_data);

            match option_type & !L2CAP_CFG_OPTION_HINT {
                L2CAP_CFG_TYPE_MTU => {
                    if option_length != L2CAP_CFG_MTU_OPTION_LEN {
                        return Err(bad_option(option_type, option_length));
                    }
                    config.mtu = Some(cursor.read_u16::<LittleEndian>().map_err(truncated)?);
                }
                L2CAP_CFG_TYPE_FLUSH_TOUT => {
                    if option_length != L2CAP_CFG_FLUSH_OPTION_LEN {
                        return Err(bad_option(option_type, option_length));
                    }
                    config.flush_timeout =
                        Some(cursor.read_u16::<LittleEndian>().map_err(truncated)?);
                }
                L2CAP_CFG_TYPE_QOS => {
                    if option_length != L2CAP_CFG_QOS_OPTION_LEN {
                        return Err(bad_option(option_type, option_length));
                    }
                    let _flags = cursor.read_u8().map_err(truncated)?;
                    config.qos = Some(QosFlowSpec {
                        service_type: cursor.read_u8().map_err(truncated)?,
                        token_rate: cursor.read_u32::<LittleEndian>().map_err(truncated)?,
                        token_bucket_size: cursor.read_u32::<LittleEndian>().map_err(truncated)?,
                        peak_bandwidth: cursor.read_u32::<LittleEndian>().map_err(truncated)?,
                        latency: cursor.read_u32::<LittleEndian>().map_err(truncated)?,
                        delay_variation: cursor.read_u32::<LittleEndian>().map_err(truncated)?,
                    });
                }
                L2CAP_CFG_TYPE_FCR => {
                    if option_length != L2CAP_CFG_FCR_OPTION_LEN {
                        return Err(bad_option(option_type, option_length));
                    }
                    let raw_mode = cursor.read_u8().map_err(truncated)?;
                    let mode = RetransmissionMode::from_u8(raw_mode).ok_or_else(|| {
                        L2capError::MalformedSignaling(format!("unknown FCR mode {}", raw_mode))
                    })?;
                    config.fcr = Some(RetransmissionFlowControl {
                        mode,
                        tx_window_size: cursor.read_u8().map_err(truncated)?,
                        max_transmit: cursor.read_u8().map_err(truncated)?,
                        retransmit_timeout: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
                        monitor_timeout: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
                        max_pdu_size: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
                    });
                }
                L2CAP_CFG_TYPE_FCS => {
                    if option_length != L2CAP_CFG_FCS_OPTION_LEN {
                        return Err(bad_option(option_type, option_length));
                    }
                    config.fcs = Some(option_data[0]);
                }
                L2CAP_CFG_TYPE_EXT_FLOW => {
                    if option_length != L2CAP_CFG_EXT_FLOW_OPTION_LEN {
                        return Err(bad_option(option_type, option_length));
                    }
                    config.ext_flow_spec = Some(ExtendedFlowSpec {
                        identifier: cursor.read_u8().map_err(truncated)?,
                        service_type: cursor.read_u8().map_err(truncated)?,
                        max_sdu_size: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
                        sdu_inter_arrival_time: cursor
                            .read_u32::<LittleEndian>()
                            .map_err(truncated)?,
                        access_latency: cursor.read_u32::<LittleEndian>().map_err(truncated)?,
                        flush_timeout: cursor.read_u32::<LittleEndian>().map_err(truncated)?,
                    });
                }
                L2CAP_CFG_TYPE_EXT_WIN_SIZE => {
                    if option_length != L2CAP_CFG_EXT_WIN_SIZE_LEN {
                        return Err(bad_option(option_type, option_length));
                    }
                    config.ext_window_size =
                        Some(cursor.read_u16::<LittleEndian>().map_err(truncated)?);
                }
                _ => {
                    if option_type & L2CAP_CFG_OPTION_HINT == 0 {
                        unknown.extend_from_slice(&data[offset..end]);
                    }
                }
            }

            offset = end;
        }

        Ok(unknown)
    }

    /// Serialize configuration options to bytes
    fn serialize_config_options(config: &ConfigInfo, out: &mut Vec<u8>) {
        if let Some(mtu) = config.mtu {
            out.push(L2CAP_CFG_TYPE_MTU);
            out.push(L2CAP_CFG_MTU_OPTION_LEN);
            out.extend_from_slice(&mtu.to_le_bytes());
        }

        if let Some(timeout) = config.flush_timeout {
            out.push(L2CAP_CFG_TYPE_FLUSH_TOUT);
            out.push(L2CAP_CFG_FLUSH_OPTION_LEN);
            out.extend_from_slice(&timeout.to_le_bytes());
        }

        if let Some(qos) = config.qos {
            out.push(L2CAP_CFG_TYPE_QOS);
            out.push(L2CAP_CFG_QOS_OPTION_LEN);
            out.push(0); // flags
            out.push(qos.service_type);
            out.extend_from_slice(&qos.token_rate.to_le_bytes());
            out.extend_from_slice(&qos.token_bucket_size.to_le_bytes());
            out.extend_from_slice(&qos.peak_bandwidth.to_le_bytes());
            out.extend_from_slice(&qos.latency.to_le_bytes());
            out.extend_from_slice(&qos.delay_variation.to_le_bytes());
        }

        if let Some(fcr) = config.fcr {
            out.push(L2CAP_CFG_TYPE_FCR);
            out.push(L2CAP_CFG_FCR_OPTION_LEN);
            out.push(fcr.mode as u8);
            out.push(fcr.tx_window_size);
            out.push(fcr.max_transmit);
            out.extend_from_slice(&fcr.retransmit_timeout.to_le_bytes());
            out.extend_from_slice(&fcr.monitor_timeout.to_le_bytes());
            out.extend_from_slice(&fcr.max_pdu_size.to_le_bytes());
        }

        if let Some(fcs) = config.fcs {
            out.push(L2CAP_CFG_TYPE_FCS);
            out.push(L2CAP_CFG_FCS_OPTION_LEN);
            out.push(fcs);
        }

        if let Some(spec) = config.ext_flow_spec {
            out.push(L2CAP_CFG_TYPE_EXT_FLOW);
            out.push(L2CAP_CFG_EXT_FLOW_OPTION_LEN);
            out.push(spec.identifier);
            out.push(spec.service_type);
            out.extend_from_slice(&spec.max_sdu_size.to_le_bytes());
            out.extend_from_slice(&spec.sdu_inter_arrival_time.to_le_bytes());
            out.extend_from_slice(&spec.access_latency.to_le_bytes());
            out.extend_from_slice(&spec.flush_timeout.to_le_bytes());
        }

        if let Some(window) = config.ext_window_size {
            out.push(L2CAP_CFG_TYPE_EXT_WIN_SIZE);
            out.push(L2CAP_CFG_EXT_WIN_SIZE_LEN);
            out.extend_from_slice(&window.to_le_bytes());
        }
    }

    /// Parse the parameters of one command whose header has already been
    /// read. Returns `Ok(None)` for command codes this codec does not know.
    pub fn parse_command(header: &L2capCommandHeader, params: &[u8]) -> L2capResult<Option<Self>> {
        let identifier = header.identifier;
        let mut cursor = Cursor::new(params);

        let message = match header.code {
            L2CAP_CMD_REJECT => {
                let reason = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
                Self::CommandReject {
                    identifier,
                    reason,
                    data: params[2..].to_vec(),
                }
            }

            L2CAP_CMD_CONN_REQ => Self::ConnectionRequest {
                identifier,
                psm: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
                source_cid: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
            },

            L2CAP_CMD_CONN_RSP => Self::ConnectionResponse {
                identifier,
                destination_cid: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
                source_cid: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
                result: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
                status: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
            },

            L2CAP_CMD_CONFIG_REQ => {
                let destination_cid = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
                let flags = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
                let mut config = ConfigInfo {
                    flags,
                    ..Default::default()
                };
                let unknown_options = Self::parse_config_options(&params[4..], &mut config)?;
                Self::ConfigureRequest {
                    identifier,
                    destination_cid,
                    config,
                    unknown_options,
                }
            }

            L2CAP_CMD_CONFIG_RSP => {
                let source_cid = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
                let flags = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
                let result = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
                let mut config = ConfigInfo {
                    result,
                    flags,
                    ..Default::default()
                };
                let unknown_options = Self::parse_config_options(&params[6..], &mut config)?;
                Self::ConfigureResponse {
                    identifier,
                    source_cid,
                    config,
                    unknown_options,
                }
            }

            L2CAP_CMD_DISC_REQ => Self::DisconnectionRequest {
                identifier,
                destination_cid: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
                source_cid: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
            },

            L2CAP_CMD_DISC_RSP => Self::DisconnectionResponse {
                identifier,
                destination_cid: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
                source_cid: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
            },

            L2CAP_CMD_ECHO_REQ => Self::EchoRequest {
                identifier,
                data: params.to_vec(),
            },

            L2CAP_CMD_ECHO_RSP => Self::EchoResponse {
                identifier,
                data: params.to_vec(),
            },

            L2CAP_CMD_INFO_REQ => Self::InformationRequest {
                identifier,
                info_type: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
            },

            L2CAP_CMD_INFO_RSP => {
                let info_type = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
                let result = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
                Self::InformationResponse {
                    identifier,
                    info_type,
                    result,
                    data: params[4..].to_vec(),
                }
            }

            L2CAP_CMD_BLE_CREDIT_BASED_CONN_REQ => Self::LeCreditBasedConnectionRequest {
                identifier,
                le_psm: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
                source_cid: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
                mtu: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
                mps: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
                initial_credits: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
            },

            L2CAP_CMD_BLE_CREDIT_BASED_CONN_RSP => Self::LeCreditBasedConnectionResponse {
                identifier,
                destination_cid: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
                mtu: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
                mps: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
                initial_credits: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
                result: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
            },

            L2CAP_CMD_BLE_FLOW_CTRL_CREDIT => Self::LeFlowControlCredit {
                identifier,
                cid: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
                credits: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
            },

            _ => return Ok(None),
        };

        Ok(Some(message))
    }

    /// Parse a single signaling command from raw bytes
    pub fn parse(data: &[u8]) -> L2capResult<Self> {
        let header = L2capCommandHeader::parse(data).ok_or_else(|| {
            L2capError::MalformedSignaling("signaling data too short".into())
        })?;

        let params = &data[L2CAP_CMD_OVERHEAD..];
        if params.len() < header.length as usize {
            return Err(L2capError::MalformedSignaling(
                "command parameters too short".into(),
            ));
        }

        Self::parse_command(&header, &params[..header.length as usize])?.ok_or_else(|| {
            L2capError::MalformedSignaling(format!("unknown command code 0x{:02X}", header.code))
        })
    }

    /// Serialize the command, header included
    pub fn serialize(&self) -> Vec<u8> {
        let mut params = Vec::new();

        match self {
            Self::CommandReject { reason, data, .. } => {
                params.extend_from_slice(&reason.to_le_bytes());
                params.extend_from_slice(data);
            }

            Self::ConnectionRequest {
                psm, source_cid, ..
            } => {
                params.extend_from_slice(&psm.to_le_bytes());
                params.extend_from_slice(&source_cid.to_le_bytes());
            }

            Self::ConnectionResponse {
                destination_cid,
                source_cid,
                result,
                status,
                ..
            } => {
                params.extend_from_slice(&destination_cid.to_le_bytes());
                params.extend_from_slice(&source_cid.to_le_bytes());
                params.extend_from_slice(&result.to_le_bytes());
                params.extend_from_slice(&status.to_le_bytes());
            }

            Self::ConfigureRequest {
                destination_cid,
                config,
                unknown_options,
                ..
            } => {
                params.extend_from_slice(&destination_cid.to_le_bytes());
                params.extend_from_slice(&config.flags.to_le_bytes());
                Self::serialize_config_options(config, &mut params);
                params.extend_from_slice(unknown_options);
            }

            Self::ConfigureResponse {
                source_cid,
                config,
                unknown_options,
                ..
            } => {
                params.extend_from_slice(&source_cid.to_le_bytes());
                params.extend_from_slice(&config.flags.to_le_bytes());
                params.extend_from_slice(&config.result.to_le_bytes());
                Self::serialize_config_options(config, &mut params);
                params.extend_from_slice(unknown_options);
            }

            Self::DisconnectionRequest {
                destination_cid,
                source_cid,
                ..
            }
            | Self::DisconnectionResponse {
                destination_cid,
                source_cid,
                ..
            } => {
                params.extend_from_slice(&destination_cid.to_le_bytes());
                params.extend_from_slice(&source_cid.to_le_bytes());
            }

            Self::EchoRequest { data, .. } | Self::EchoResponse { data, .. } => {
                params.extend_from_slice(data);
            }

            Self::InformationRequest { info_type, .. } => {
                params.extend_from_slice(&info_type.to_le_bytes());
            }

            Self::InformationResponse {
                info_type,
                result,
                data,
                ..
            } => {
                params.extend_from_slice(&info_type.to_le_bytes());
                params.extend_from_slice(&result.to_le_bytes());
                params.extend_from_slice(data);
            }

            Self::LeCreditBasedConnectionRequest {
                le_psm,
                source_cid,
                mtu,
                mps,
                initial_credits,
                ..
            } => {
                params.extend_from_slice(&le_psm.to_le_bytes());
                params.extend_from_slice(&source_cid.to_le_bytes());
                params.extend_from_slice(&mtu.to_le_bytes());
                params.extend_from_slice(&mps.to_le_bytes());
                params.extend_from_slice(&initial_credits.to_le_bytes());
            }

            Self::LeCreditBasedConnectionResponse {
                destination_cid,
                mtu,
                mps,
                initial_credits,
                result,
                ..
            } => {
                params.extend_from_slice(&destination_cid.to_le_bytes());
                params.extend_from_slice(&mtu.to_le_bytes());
                params.extend_from_slice(&mps.to_le_bytes());
                params.extend_from_slice(&initial_credits.to_le_bytes());
                params.extend_from_slice(&result.to_le_bytes());
            }

            Self::LeFlowControlCredit { cid, credits, .. } => {
                params.extend_from_slice(&cid.to_le_bytes());
                params.extend_from_slice(&credits.to_le_bytes());
            }
        }

        let header =
            L2capCommandHeader::new(self.command_code(), self.identifier(), params.len() as u16);
        let mut out = Vec::with_capacity(L2CAP_CMD_OVERHEAD + params.len());
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&params);
        out
    }
}
