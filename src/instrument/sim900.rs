//! SRS SIM900 mainframe and the command set shared by every SIM module.
//!
//! A module can be reached directly on its own serial port or through a mainframe slot.
//! In the second case every exchange is wrapped in `CONN`/escape so the mainframe routes
//! it to the right slot; [`PortLink`] does that wrapping and is what the module drivers
//! hold when they live in a mainframe.

use super::sim921::Sim921;
use super::sim922::Sim922;
use super::sim925::Sim925;
use crate::adapters::Transport;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Accepted spellings of SIM boolean parameters.
pub const BOOLEAN_TOKENS: [&str; 4] = ["OFF", "0", "ON", "1"];

/// Mainframe ports: 1–8 hold modules, 9–D are the remote and auxiliary ports.
pub const PORTS: [char; 13] = ['1', '2', '3', '4', '5', '6', '7', '8', '9', 'A', 'B', 'C', 'D'];

/// Escape string that ends a `CONN` session.
pub const ESCAPE: &str = "ESCAPE";

/// How long to listen for autodetection replies after the mainframe's one second wait.
const AUTODETECT_QUIET: Duration = Duration::from_millis(1500);

pub fn check_boolean_token(value: &str) -> Result<()> {
    if BOOLEAN_TOKENS.contains(&value.to_uppercase().as_str()) {
        Ok(())
    } else {
        bail!("'{}' is not one of the boolean tokens {:?}", value, BOOLEAN_TOKENS)
    }
}

pub(crate) fn parse_reply<T: std::str::FromStr>(reply: &str, command: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    reply
        .trim()
        .parse::<T>()
        .with_context(|| format!("Could not parse reply '{}' to {}", reply, command))
}

/// A channel to one SIM device.
#[async_trait]
pub trait SimLink: Send {
    async fn send(&mut self, message: &str) -> Result<()>;

    async fn query(&mut self, message: &str) -> Result<String>;

    /// Send `messages` in one session, pausing `delay` after each.
    async fn send_paced(&mut self, messages: &[String], delay: Duration) -> Result<()>;

    async fn token(&mut self) -> Result<String> {
        self.query("TOKN?").await
    }

    async fn set_token(&mut self, mode: &str) -> Result<()> {
        check_boolean_token(mode)?;
        self.send(&format!("TOKN {}", mode)).await
    }

    async fn identity(&mut self) -> Result<String> {
        self.query("*IDN?").await
    }

    async fn reset(&mut self) -> Result<()> {
        self.send("*RST").await
    }
}

/// A module on its own transport.
pub struct Direct<T: Transport> {
    transport: T,
}

impl<T: Transport> Direct<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn into_inner(self) -> T {
        self.transport
    }
}

#[async_trait]
impl<T: Transport> SimLink for Direct<T> {
    async fn send(&mut self, message: &str) -> Result<()> {
        self.transport.write_line(message).await
    }

    async fn query(&mut self, message: &str) -> Result<String> {
        self.transport.query(message).await
    }

    async fn send_paced(&mut self, messages: &[String], delay: Duration) -> Result<()> {
        for message in messages {
            self.transport.write_line(message).await?;
            sleep(delay).await;
        }
        Ok(())
    }
}

/// What answered on a mainframe port during autodetection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimModule {
    Sim921 { serial_number: String, firmware: String },
    Sim922 { serial_number: String, firmware: String },
    Sim925 { serial_number: String, firmware: String },
    Unknown(String),
}

impl SimModule {
    /// Classify an identification string such as `Stanford_Research_Systems,SIM921,s/n012345,ver2.1`.
    pub fn from_identification(identification: &str) -> Self {
        let fields: Vec<&str> = identification.split(',').map(str::trim).collect();
        if fields.len() != 4 {
            return SimModule::Unknown(identification.to_string());
        }
        let serial_number = fields[2].to_string();
        let firmware = fields[3].to_string();
        match fields[1] {
            "SIM921" => SimModule::Sim921 { serial_number, firmware },
            "SIM922" => SimModule::Sim922 { serial_number, firmware },
            "SIM925" => SimModule::Sim925 { serial_number, firmware },
            other => SimModule::Unknown(other.to_string()),
        }
    }

    pub fn model(&self) -> &str {
        match self {
            SimModule::Sim921 { .. } => "SIM921",
            SimModule::Sim922 { .. } => "SIM922",
            SimModule::Sim925 { .. } => "SIM925",
            SimModule::Unknown(model) => model,
        }
    }
}

/// Split a pass-through message `MSG p,body` into its port and body.
pub fn parse_message(message: &str) -> Result<(char, &str)> {
    let (header, body) = message
        .split_once(',')
        .ok_or_else(|| anyhow!("Message '{}' has no port separator", message))?;
    let port = header
        .trim_end()
        .chars()
        .last()
        .ok_or_else(|| anyhow!("Message '{}' has an empty header", message))?;
    Ok((port, body))
}

/// Strip the `#<n><n digits>` header of an IEEE 488.2 definite-length block.
pub fn parse_definite_length(message: &str) -> Result<&str> {
    let digits = message
        .strip_prefix('#')
        .and_then(|rest| rest.chars().next())
        .and_then(|c| c.to_digit(10))
        .ok_or_else(|| anyhow!("'{}' is not a definite-length block", message))? as usize;
    message
        .get(2 + digits..)
        .ok_or_else(|| anyhow!("Definite-length block '{}' is truncated", message))
}

pub struct Sim900<T: Transport> {
    transport: T,
    connected: Option<char>,
    ports: BTreeMap<char, SimModule>,
}

impl<T: Transport> Sim900<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            connected: None,
            ports: BTreeMap::new(),
        }
    }

    /// Bring the mainframe to a known state: leave any open session, reset, flush every
    /// queue and reset every module, then optionally find out what is installed.
    pub async fn initialize(&mut self, autodetect: bool) -> Result<()> {
        self.disconnect().await?;
        self.reset().await?;
        self.flush(None).await?;
        self.sim_reset(None).await?;
        if autodetect {
            self.autodetect().await?;
        }
        info!(modules = self.ports.len(), "SIM900 initialized");
        Ok(())
    }

    pub fn connected(&self) -> Option<char> {
        self.connected
    }

    /// Modules found by the last [`Sim900::autodetect`].
    pub fn ports(&self) -> &BTreeMap<char, SimModule> {
        &self.ports
    }

    pub async fn broadcast(&mut self, message: &str) -> Result<()> {
        self.send(&format!("BRDT \"{}\"", message)).await
    }

    /// Flush the queues of one port, or of every port.
    pub async fn flush(&mut self, port: Option<char>) -> Result<()> {
        match port {
            None => self.send("FLSH").await,
            Some(p) if PORTS.contains(&p) => self.send(&format!("SRST {}", p)).await,
            Some(p) => bail!("Invalid SIM900 port '{}'", p),
        }
    }

    /// Send the SIM reset signal to module port 1–8, or to all of them.
    pub async fn sim_reset(&mut self, port: Option<u8>) -> Result<()> {
        match port {
            None => self.send("SRST").await,
            Some(p @ 1..=8) => self.send(&format!("SRST {}", p)).await,
            Some(p) => bail!("Invalid SIM port {}; modules sit in ports 1 through 8", p),
        }
    }

    pub async fn connect(&mut self, port: char) -> Result<()> {
        if let Some(current) = self.connected {
            bail!("SIM900 is already connected to port {}", current);
        }
        if !PORTS.contains(&port) {
            bail!("Invalid SIM900 port '{}'", port);
        }
        self.transport
            .write_line(&format!("CONN {},\"{}\"", port, ESCAPE))
            .await?;
        self.connected = Some(port);
        Ok(())
    }

    /// Send the escape string. The port is forgotten even when the write fails.
    pub async fn disconnect(&mut self) -> Result<()> {
        self.connected = None;
        self.transport.write_line(ESCAPE).await
    }

    /// Ask every module for its identification and record what answered on each port.
    pub async fn autodetect(&mut self) -> Result<&BTreeMap<char, SimModule>> {
        self.send("BRER 510").await?;
        self.send("RPER 510").await?;
        self.broadcast("*IDN?").await?;
        self.send("WAIT 1000").await?;
        self.send("BRER 0").await?;
        self.send("RPER 0").await?;
        let lines = self.transport.read_lines(AUTODETECT_QUIET).await?;

        self.ports.clear();
        for line in lines.iter().map(|l| l.trim()).filter(|l| !l.is_empty()) {
            let parsed = parse_message(line).and_then(|(port, body)| Ok((port, parse_definite_length(body)?)));
            match parsed {
                Ok((port, identification)) => {
                    let module = SimModule::from_identification(identification);
                    debug!(%port, model = module.model(), "SIM module detected");
                    self.ports.insert(port, module);
                }
                Err(e) => warn!(line, error = %e, "ignoring unexpected autodetect reply"),
            }
        }
        Ok(&self.ports)
    }

    pub fn port(&mut self, port: char) -> PortLink<'_, T> {
        PortLink { mainframe: self, port }
    }

    pub fn sim921(&mut self, port: char) -> Sim921<PortLink<'_, T>> {
        Sim921::new(self.port(port))
    }

    pub fn sim922(&mut self, port: char) -> Sim922<PortLink<'_, T>> {
        Sim922::new(self.port(port))
    }

    pub fn sim925(&mut self, port: char) -> Sim925<PortLink<'_, T>> {
        Sim925::new(self.port(port))
    }
}

#[async_trait]
impl<T: Transport> SimLink for Sim900<T> {
    async fn send(&mut self, message: &str) -> Result<()> {
        self.transport.write_line(message).await
    }

    async fn query(&mut self, message: &str) -> Result<String> {
        self.transport.query(message).await
    }

    async fn send_paced(&mut self, messages: &[String], delay: Duration) -> Result<()> {
        for message in messages {
            self.transport.write_line(message).await?;
            sleep(delay).await;
        }
        Ok(())
    }
}

/// A module reached through a mainframe port. Each call is one connect/disconnect
/// session, and the session is closed even when the exchange fails.
pub struct PortLink<'a, T: Transport> {
    mainframe: &'a mut Sim900<T>,
    port: char,
}

impl<T: Transport> PortLink<'_, T> {
    pub fn port(&self) -> char {
        self.port
    }
}

#[async_trait]
impl<'a, T: Transport> SimLink for PortLink<'a, T> {
    async fn send(&mut self, message: &str) -> Result<()> {
        self.mainframe.connect(self.port).await?;
        let result = self.mainframe.transport.write_line(message).await;
        self.mainframe.disconnect().await?;
        result
    }

    async fn query(&mut self, message: &str) -> Result<String> {
        self.mainframe.connect(self.port).await?;
        let result = self.mainframe.transport.query(message).await;
        self.mainframe.disconnect().await?;
        result.with_context(|| format!("Query '{}' to SIM port {} failed", message, self.port))
    }

    async fn send_paced(&mut self, messages: &[String], delay: Duration) -> Result<()> {
        self.mainframe.connect(self.port).await?;
        let mut result = Ok(());
        for message in messages {
            result = self.mainframe.transport.write_line(message).await;
            if result.is_err() {
                break;
            }
            sleep(delay).await;
        }
        self.mainframe.disconnect().await?;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockAdapter;

    #[test]
    fn test_parse_message() {
        assert_eq!(parse_message("MSG 1,something").unwrap(), ('1', "something"));
        assert_eq!(parse_message("MSG A,a,b").unwrap(), ('A', "a,b"));
        assert!(parse_message("no separator").is_err());
    }

    #[test]
    fn test_parse_definite_length() {
        assert_eq!(parse_definite_length("#3011hello world").unwrap(), "hello world");
        assert!(parse_definite_length("hello").is_err());
        assert!(parse_definite_length("#9").is_err());
    }

    #[test]
    fn test_boolean_tokens() {
        assert!(check_boolean_token("on").is_ok());
        assert!(check_boolean_token("0").is_ok());
        assert!(check_boolean_token("maybe").is_err());
    }

    #[test]
    fn test_module_classification() {
        let module = SimModule::from_identification("Stanford_Research_Systems,SIM921,s/n012345,ver2.1");
        assert_eq!(
            module,
            SimModule::Sim921 {
                serial_number: "s/n012345".to_string(),
                firmware: "ver2.1".to_string()
            }
        );
        assert_eq!(SimModule::from_identification("SRS,SIM970,1,1").model(), "SIM970");
        assert!(matches!(SimModule::from_identification("garbage"), SimModule::Unknown(_)));
    }

    #[tokio::test]
    async fn test_mainframe_commands() {
        let mock = MockAdapter::new();
        let mut sim900 = Sim900::new(mock.clone());
        sim900.broadcast("*IDN?").await.unwrap();
        sim900.flush(None).await.unwrap();
        sim900.flush(Some('3')).await.unwrap();
        sim900.sim_reset(Some(4)).await.unwrap();
        assert!(sim900.sim_reset(Some(9)).await.is_err());
        assert!(sim900.flush(Some('Z')).await.is_err());
        assert_eq!(mock.call_log(), vec!["BRDT \"*IDN?\"", "FLSH", "SRST 3", "SRST 4"]);
    }

    #[tokio::test]
    async fn test_connect_twice_is_an_error() {
        let mock = MockAdapter::new();
        let mut sim900 = Sim900::new(mock.clone());
        sim900.connect('2').await.unwrap();
        assert!(sim900.connect('3').await.is_err());
        sim900.disconnect().await.unwrap();
        assert_eq!(sim900.connected(), None);
        assert_eq!(mock.call_log(), vec!["CONN 2,\"ESCAPE\"", "ESCAPE"]);
    }

    #[tokio::test]
    async fn test_autodetect_classifies_ports() {
        let mock = MockAdapter::new();
        mock.on(
            "RPER 0",
            &[
                "MSG 1,#3052Stanford_Research_Systems,SIM921,s/n000001,ver2.1",
                "",
                "MSG 5,#3052Stanford_Research_Systems,SIM922,s/n000002,ver1.0",
                "not a message",
            ],
        );
        let mut sim900 = Sim900::new(mock.clone());
        let ports = sim900.autodetect().await.unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[&'1'].model(), "SIM921");
        assert_eq!(ports[&'5'].model(), "SIM922");
        assert_eq!(
            mock.call_log(),
            vec!["BRER 510", "RPER 510", "BRDT \"*IDN?\"", "WAIT 1000", "BRER 0", "RPER 0"]
        );
    }

    #[tokio::test]
    async fn test_port_link_wraps_each_exchange() {
        let mock = MockAdapter::new();
        mock.on("*IDN?", &["Stanford_Research_Systems,SIM925,s/n3,ver1"]);
        let mut sim900 = Sim900::new(mock.clone());
        let identity = sim900.port('7').identity().await.unwrap();
        assert!(identity.contains("SIM925"));
        assert_eq!(mock.call_log(), vec!["CONN 7,\"ESCAPE\"", "*IDN?", "ESCAPE"]);
        assert_eq!(sim900.connected(), None);
    }

    #[tokio::test]
    async fn test_port_link_disconnects_after_failure() {
        let mock = MockAdapter::new();
        let mut sim900 = Sim900::new(mock.clone());
        assert!(sim900.port('2').query("TVAL?").await.is_err());
        assert_eq!(sim900.connected(), None);
        assert_eq!(mock.call_log().last().map(String::as_str), Some("ESCAPE"));
    }

    #[tokio::test]
    async fn test_failed_escape_still_releases_port() {
        let mock = MockAdapter::new();
        mock.on("TVAL?", &["1.5"]);
        mock.fail_writes_after(2);
        let mut sim900 = Sim900::new(mock.clone());
        assert!(sim900.port('2').query("TVAL?").await.is_err());
        assert_eq!(sim900.connected(), None);
        assert_eq!(mock.call_log(), vec!["CONN 2,\"ESCAPE\"", "TVAL?"]);

        // The next exchange can connect again once the transport recovers.
        mock.fail_writes_after(usize::MAX);
        assert_eq!(sim900.port('2').query("TVAL?").await.unwrap(), "1.5");
        assert_eq!(sim900.connected(), None);
    }
}
