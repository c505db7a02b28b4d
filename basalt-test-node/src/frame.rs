//! Reading request frames and forging response frames, server-side.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use basalt_wire::frame::frame_errors::FrameHeaderParseError;
use basalt_wire::frame::request::{
    AuthResponse, DeserializableRequest, Query, RequestDeserializationError, RequestOpcode,
    Startup,
};
use basalt_wire::frame::response::error::DbError;
use basalt_wire::frame::response::ResponseOpcode;
use basalt_wire::frame::{types, FrameParams, HEADER_SIZE};

/// Parts of the header plus the raw body of a request received from a
/// driver.
#[derive(Clone, Debug)]
pub struct RequestFrame {
    pub params: FrameParams,
    pub opcode: RequestOpcode,
    pub body: Bytes,
}

/// A request body deserialized as far as the mock node cares.
pub enum Request<'r> {
    Startup(Startup<'r>),
    Options,
    Query(Query<'r>),
    AuthResponse(AuthResponse),
    /// Request kinds a real node would serve but the mock does not model.
    Other(RequestOpcode),
}

impl RequestFrame {
    pub fn deserialize(&self) -> Result<Request<'static>, RequestDeserializationError> {
        let buf = &mut &self.body[..];
        Ok(match self.opcode {
            RequestOpcode::Startup => Request::Startup(Startup::deserialize(buf)?),
            RequestOpcode::Options => Request::Options,
            RequestOpcode::Query => Request::Query(Query::deserialize(buf)?),
            RequestOpcode::AuthResponse => Request::AuthResponse(AuthResponse::deserialize(buf)?),
            other => Request::Other(other),
        })
    }
}

/// A response frame the mock node is about to send.
#[derive(Clone, Debug)]
pub struct ResponseFrame {
    pub params: FrameParams,
    pub opcode: ResponseOpcode,
    pub body: Bytes,
}

fn for_response(request_params: FrameParams) -> FrameParams {
    FrameParams {
        version: 0x80 | (request_params.version & 0x7F),
        flags: 0,
        stream: request_params.stream,
    }
}

impl ResponseFrame {
    pub fn forged_ready(request_params: FrameParams) -> Self {
        ResponseFrame {
            params: for_response(request_params),
            opcode: ResponseOpcode::Ready,
            body: Bytes::new(),
        }
    }

    /// Creates a response frame that signifies the given error type. Useful
    /// for testing driver-side error handling.
    pub fn forged_error(request_params: FrameParams, error: DbError, msg: &str) -> Self {
        let mut buf = BytesMut::new();
        types::write_int(error.code(), &mut buf);
        types::write_string(msg, &mut buf).unwrap();

        ResponseFrame {
            params: for_response(request_params),
            opcode: ResponseOpcode::Error,
            body: buf.freeze(),
        }
    }

    /// Creates a SUPPORTED response with the given options.
    pub fn forged_supported(
        request_params: FrameParams,
        options: &HashMap<String, Vec<String>>,
    ) -> Self {
        let mut buf = BytesMut::new();
        types::write_string_multimap(options, &mut buf).unwrap();

        ResponseFrame {
            params: for_response(request_params),
            opcode: ResponseOpcode::Supported,
            body: buf.freeze(),
        }
    }

    pub fn forged_authenticate(request_params: FrameParams, authenticator_name: &str) -> Self {
        let mut buf = BytesMut::new();
        types::write_string(authenticator_name, &mut buf).unwrap();

        ResponseFrame {
            params: for_response(request_params),
            opcode: ResponseOpcode::Authenticate,
            body: buf.freeze(),
        }
    }

    pub fn forged_auth_challenge(request_params: FrameParams, token: Option<&[u8]>) -> Self {
        let mut buf = BytesMut::new();
        types::write_bytes_opt(token, &mut buf).unwrap();

        ResponseFrame {
            params: for_response(request_params),
            opcode: ResponseOpcode::AuthChallenge,
            body: buf.freeze(),
        }
    }

    pub fn forged_auth_success(request_params: FrameParams, token: Option<&[u8]>) -> Self {
        let mut buf = BytesMut::new();
        types::write_bytes_opt(token, &mut buf).unwrap();

        ResponseFrame {
            params: for_response(request_params),
            opcode: ResponseOpcode::AuthSuccess,
            body: buf.freeze(),
        }
    }

    pub fn forged_void_result(request_params: FrameParams) -> Self {
        let mut buf = BytesMut::new();
        types::write_int(0x0001, &mut buf);

        ResponseFrame {
            params: for_response(request_params),
            opcode: ResponseOpcode::Result,
            body: buf.freeze(),
        }
    }

    pub fn forged_set_keyspace_result(request_params: FrameParams, keyspace_name: &str) -> Self {
        let mut buf = BytesMut::new();
        types::write_int(0x0003, &mut buf);
        types::write_string(keyspace_name, &mut buf).unwrap();

        ResponseFrame {
            params: for_response(request_params),
            opcode: ResponseOpcode::Result,
            body: buf.freeze(),
        }
    }

    pub async fn write(
        &self,
        writer: &mut (impl AsyncWrite + Unpin),
    ) -> Result<(), tokio::io::Error> {
        let mut header = [0; HEADER_SIZE];

        header[0] = self.params.version;
        header[1] = self.params.flags;
        header[2..=3].copy_from_slice(&self.params.stream.to_be_bytes());
        header[4] = self.opcode as u8;
        header[5..9].copy_from_slice(&(self.body.len() as u32).to_be_bytes());

        writer.write_all(&header).await?;
        writer.write_all(&self.body).await?;
        writer.flush().await?;
        Ok(())
    }
}

pub(crate) async fn read_request_frame(
    reader: &mut (impl AsyncRead + Unpin),
) -> Result<RequestFrame, FrameHeaderParseError> {
    let mut raw_header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut raw_header[..]).await?;

    let mut buf = &raw_header[..];

    let version = buf.get_u8();
    if version & 0x80 != 0x00 {
        return Err(FrameHeaderParseError::FrameFromServer);
    }

    let flags = buf.get_u8();
    let stream = buf.get_i16();

    let params = FrameParams {
        version,
        flags,
        stream,
    };

    let opcode = RequestOpcode::try_from(buf.get_u8())?;

    let length = buf.get_u32() as usize;

    let mut body = Vec::with_capacity(length).limit(length);
    while body.has_remaining_mut() {
        let n = reader.read_buf(&mut body).await?;
        if n == 0 {
            // EOF, too early
            return Err(FrameHeaderParseError::ConnectionClosed(
                body.remaining_mut(),
                length,
            ));
        }
    }

    Ok(RequestFrame {
        params,
        opcode,
        body: body.into_inner().into(),
    })
}
