// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

//! Provides functions for parsing Urls from strings.

use url::Url;

use uasc_types::{Error, StatusCode};

use crate::constants::DEFAULT_OPC_UA_SERVER_PORT;

/// The scheme of the binary transport.
pub const OPC_TCP_SCHEME: &str = "opc.tcp";

fn opc_url_from_str(s: &str) -> Result<Url, Error> {
    Url::parse(s).map_err(|err| {
        Error::new(
            StatusCode::BadTcpEndpointUrlInvalid,
            format!("Cannot parse url \"{s}\": {err}"),
        )
    })
}

/// Test if the url is a valid opc.tcp url.
pub fn is_opc_ua_binary_url(url: &str) -> bool {
    opc_url_from_str(url)
        .map(|url| url.scheme() == OPC_TCP_SCHEME)
        .unwrap_or(false)
}

/// Extract the host and port from an opc.tcp url, filling in the default port if the url
/// does not name one.
pub fn hostname_port_from_url(url: &str, default_port: u16) -> Result<(String, u16), Error> {
    let url = opc_url_from_str(url)?;
    if url.scheme() != OPC_TCP_SCHEME {
        return Err(Error::new(
            StatusCode::BadTcpEndpointUrlInvalid,
            format!("Url \"{url}\" does not use the {OPC_TCP_SCHEME} scheme"),
        ));
    }
    let host = url
        .host_str()
        .ok_or_else(|| {
            Error::new(
                StatusCode::BadTcpEndpointUrlInvalid,
                format!("Url \"{url}\" has no host"),
            )
        })?
        .to_string();
    let port = url.port().unwrap_or(default_port);
    Ok((host, port))
}

/// Extract the host and port from an opc.tcp url with the standard default port.
pub fn hostname_port_from_url_default(url: &str) -> Result<(String, u16), Error> {
    hostname_port_from_url(url, DEFAULT_OPC_UA_SERVER_PORT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse() {
        let (host, port) = hostname_port_from_url("opc.tcp://localhost:4855/path", 4840).unwrap();
        assert_eq!(host, "localhost");
        assert_eq!(port, 4855);

        let (host, port) = hostname_port_from_url("opc.tcp://192.168.0.1", 4840).unwrap();
        assert_eq!(host, "192.168.0.1");
        assert_eq!(port, 4840);
    }

    #[test]
    fn scheme() {
        assert!(is_opc_ua_binary_url("opc.tcp://localhost:4840"));
        assert!(!is_opc_ua_binary_url("http://localhost:4840"));
        assert!(!is_opc_ua_binary_url("localhost"));
        assert!(hostname_port_from_url("http://localhost", 4840).is_err());
    }
}
