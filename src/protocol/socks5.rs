//! SOCKS5 client implementation (RFC 1928 / RFC 1929)

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::common::{Address, Result};
use crate::error::Error;

use super::Socks5Config;

const SOCKS5_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_PASSWORD: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
const AUTH_PASSWORD_VERSION: u8 = 0x01;

const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_NOT_ALLOWED: u8 = 0x02;
const REP_NETWORK_UNREACHABLE: u8 = 0x03;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_CONNECTION_REFUSED: u8 = 0x05;
const REP_TTL_EXPIRED: u8 = 0x06;
const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

/// SOCKS5 client side handshake
#[derive(Debug, Clone, Default)]
pub struct Socks5Client {
    config: Socks5Config,
}

impl Socks5Client {
    pub fn new(config: Socks5Config) -> Self {
        Self { config }
    }

    fn requires_auth(&self) -> bool {
        self.config.username.is_some() && self.config.password.is_some()
    }

    /// Ask the server to CONNECT to `target`, returning the bound address.
    pub async fn connect<S>(&self, stream: &mut S, target: &Address) -> Result<Address>
    where
        S: AsyncRead + AsyncWrite + Unpin + ?Sized,
    {
        self.negotiate(stream).await?;
        self.request(stream, CMD_CONNECT, target).await
    }

    /// Open a UDP association, returning the relay address datagrams must
    /// be sent to. `local` is the address the client will send from, or
    /// unspecified when unknown.
    pub async fn udp_associate<S>(&self, stream: &mut S, local: &Address) -> Result<Address>
    where
        S: AsyncRead + AsyncWrite + Unpin + ?Sized,
    {
        self.negotiate(stream).await?;
        self.request(stream, CMD_UDP_ASSOCIATE, local).await
    }

    /// Greeting, method selection and optional username/password auth
    async fn negotiate<S>(&self, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + ?Sized,
    {
        // 1. Send greeting
        if self.requires_auth() {
            stream
                .write_all(&[SOCKS5_VERSION, 2, AUTH_NONE, AUTH_PASSWORD])
                .await?;
        } else {
            stream.write_all(&[SOCKS5_VERSION, 1, AUTH_NONE]).await?;
        }

        // 2. Read server's selected method
        let mut response = [0u8; 2];
        stream.read_exact(&mut response).await?;

        if response[0] != SOCKS5_VERSION {
            return Err(Error::ProtocolMismatch(format!(
                "server answered greeting with version {}",
                response[0]
            )));
        }

        match response[1] {
            AUTH_NONE => Ok(()),
            AUTH_PASSWORD if self.requires_auth() => self.authenticate(stream).await,
            AUTH_PASSWORD | AUTH_NO_ACCEPTABLE => Err(Error::AuthenticationFailed),
            method => Err(Error::ProtocolMismatch(format!(
                "server selected unoffered method {:#04x}",
                method
            ))),
        }
    }

    async fn authenticate<S>(&self, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + ?Sized,
    {
        let username = self.config.username.as_deref().unwrap_or("");
        let password = self.config.password.as_deref().unwrap_or("");
        if username.len() > 255 || password.len() > 255 {
            return Err(Error::InvalidConfiguration("credential longer than 255 bytes".into()));
        }

        let mut auth_request = Vec::with_capacity(3 + username.len() + password.len());
        auth_request.push(AUTH_PASSWORD_VERSION);
        auth_request.push(username.len() as u8);
        auth_request.extend_from_slice(username.as_bytes());
        auth_request.push(password.len() as u8);
        auth_request.extend_from_slice(password.as_bytes());
        stream.write_all(&auth_request).await?;

        let mut auth_response = [0u8; 2];
        stream.read_exact(&mut auth_response).await?;

        if auth_response[0] != AUTH_PASSWORD_VERSION {
            return Err(Error::ProtocolMismatch(format!(
                "invalid auth reply version {}",
                auth_response[0]
            )));
        }
        if auth_response[1] != 0x00 {
            return Err(Error::AuthenticationFailed);
        }

        trace!("SOCKS5 authenticated as {}", username);
        Ok(())
    }

    async fn request<S>(&self, stream: &mut S, cmd: u8, target: &Address) -> Result<Address>
    where
        S: AsyncRead + AsyncWrite + Unpin + ?Sized,
    {
        let mut request = BytesMut::with_capacity(22);
        request.put_slice(&[SOCKS5_VERSION, cmd, 0x00]);
        write_address(&mut request, target)?;
        stream.write_all(&request).await?;
        stream.flush().await?;

        let mut response = [0u8; 4];
        stream.read_exact(&mut response).await?;

        if response[0] != SOCKS5_VERSION {
            return Err(Error::ProtocolMismatch(format!(
                "invalid SOCKS version {} in reply",
                response[0]
            )));
        }

        if response[1] != REP_SUCCESS {
            return Err(Error::ProtocolMismatch(format!(
                "SOCKS5 error: {}",
                reply_message(response[1])
            )));
        }

        read_address(stream, response[3]).await
    }
}

fn reply_message(code: u8) -> &'static str {
    match code {
        REP_GENERAL_FAILURE => "General failure",
        REP_NOT_ALLOWED => "Connection not allowed",
        REP_NETWORK_UNREACHABLE => "Network unreachable",
        REP_HOST_UNREACHABLE => "Host unreachable",
        REP_CONNECTION_REFUSED => "Connection refused",
        REP_TTL_EXPIRED => "TTL expired",
        REP_CMD_NOT_SUPPORTED => "Command not supported",
        REP_ATYP_NOT_SUPPORTED => "Address type not supported",
        _ => "Unknown error",
    }
}

/// Append ATYP + address + port
fn write_address(buf: &mut BytesMut, addr: &Address) -> Result<()> {
    match addr {
        Address::Socket(SocketAddr::V4(v4)) => {
            buf.put_u8(ATYP_IPV4);
            buf.put_slice(&v4.ip().octets());
            buf.put_u16(v4.port());
        }
        Address::Socket(SocketAddr::V6(v6)) => {
            buf.put_u8(ATYP_IPV6);
            buf.put_slice(&v6.ip().octets());
            buf.put_u16(v6.port());
        }
        Address::Domain(domain, port) => {
            if domain.len() > 255 {
                return Err(Error::ProtocolMismatch(format!("domain too long: {}", domain)));
            }
            buf.put_u8(ATYP_DOMAIN);
            buf.put_u8(domain.len() as u8);
            buf.put_slice(domain.as_bytes());
            buf.put_u16(*port);
        }
    }
    Ok(())
}

async fn read_address<S>(stream: &mut S, atyp: u8) -> Result<Address>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let address = match atyp {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            let port = stream.read_u16().await?;
            Address::Socket(SocketAddr::new(Ipv4Addr::from(addr).into(), port))
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut domain = vec![0u8; len];
            stream.read_exact(&mut domain).await?;
            let port = stream.read_u16().await?;
            Address::Domain(String::from_utf8_lossy(&domain).to_string(), port)
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            let port = stream.read_u16().await?;
            Address::Socket(SocketAddr::new(Ipv6Addr::from(addr).into(), port))
        }
        _ => {
            return Err(Error::ProtocolMismatch(format!(
                "unsupported address type {} in reply",
                atyp
            )));
        }
    };

    Ok(address)
}

// ============================================================================
// UDP relay framing
// ============================================================================

/// Prefix `payload` with the UDP request header addressed to `target`.
pub fn encode_udp_datagram(target: &Address, payload: &[u8]) -> Result<BytesMut> {
    let mut buf = BytesMut::with_capacity(22 + payload.len());
    // RSV(2) + FRAG(1)
    buf.put_slice(&[0x00, 0x00, 0x00]);
    write_address(&mut buf, target)?;
    buf.put_slice(payload);
    Ok(buf)
}

/// Split a relayed datagram into its source address and payload.
///
/// Fragmented datagrams (FRAG != 0) are rejected.
pub fn decode_udp_datagram(data: &[u8]) -> Result<(Address, &[u8])> {
    if data.len() < 4 {
        return Err(Error::ProtocolMismatch("UDP datagram too short".into()));
    }
    if data[2] != 0 {
        return Err(Error::ProtocolMismatch("fragmented UDP datagram".into()));
    }

    let rest = &data[4..];
    let (address, used) = match data[3] {
        ATYP_IPV4 if rest.len() >= 6 => {
            let ip = Ipv4Addr::new(rest[0], rest[1], rest[2], rest[3]);
            let port = u16::from_be_bytes([rest[4], rest[5]]);
            (Address::Socket(SocketAddr::new(ip.into(), port)), 6)
        }
        ATYP_IPV6 if rest.len() >= 18 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&rest[..16]);
            let port = u16::from_be_bytes([rest[16], rest[17]]);
            (Address::Socket(SocketAddr::new(Ipv6Addr::from(octets).into(), port)), 18)
        }
        ATYP_DOMAIN if !rest.is_empty() && rest.len() >= 1 + rest[0] as usize + 2 => {
            let len = rest[0] as usize;
            let domain = String::from_utf8_lossy(&rest[1..1 + len]).to_string();
            let port = u16::from_be_bytes([rest[1 + len], rest[2 + len]]);
            (Address::Domain(domain, port), len + 3)
        }
        _ => return Err(Error::ProtocolMismatch("malformed UDP datagram header".into())),
    };

    Ok((address, &rest[used..]))
}
