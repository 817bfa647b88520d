//! Switching the device daemon between TCP and USB transports.
//!
//! Both services answer with one line of text and then restart the daemon,
//! which ends the current connection.

use crate::error::{ClientError, Result};
use crate::transport::Dispatcher;

/// Reply expected from `tcpip:<port>`.
pub fn tcpip_reply(port: u16) -> String {
    format!("restarting in TCP mode port: {port}\n")
}

/// Reply expected from `usb:`.
pub const USB_REPLY: &str = "restarting in USB mode\n";

/// Opens `service`, reads until the device closes it and returns the text.
pub async fn run_service(dispatcher: &Dispatcher, service: &str) -> Result<String> {
    let mut socket = dispatcher.open(service).await?;
    let reply = socket.read_to_end().await;
    Ok(String::from_utf8_lossy(&reply).into_owned())
}

fn check_reply(service: String, reply: String, expected: &str) -> Result<()> {
    if reply == expected {
        Ok(())
    } else {
        Err(ClientError::UnexpectedReply { service, reply })
    }
}

/// Restarts the daemon listening on TCP `port`.
pub async fn tcpip(dispatcher: &Dispatcher, port: u16) -> Result<()> {
    let service = format!("tcpip:{port}");
    let reply = run_service(dispatcher, &service).await?;
    tracing::info!(port, "Device restarting in TCP mode");
    check_reply(service, reply, &tcpip_reply(port))
}

/// Restarts the daemon on USB.
pub async fn usb(dispatcher: &Dispatcher) -> Result<()> {
    let service = "usb:".to_string();
    let reply = run_service(dispatcher, &service).await?;
    tracing::info!("Device restarting in USB mode");
    check_reply(service, reply, USB_REPLY)
}
