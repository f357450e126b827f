//! NMDC wire commands: parsing of received lines and rendering of outgoing ones.

/// Protocol version announced to the hub in `$Version`.
pub const PROTOCOL_VERSION: &str = "1,0091";

/// Client tag placed in the `$MyINFO` description.
pub const CLIENT_TAG: &str = "<gdc V:0.0.0,M:A,H:1/0/0,S:3>";

/// Capabilities announced to peers in `$Supports`.
pub const PEER_FEATURES: &[&str] = &["MiniSlots", "XmlBZList", "ADCGet", "TTHL", "TTHF"];

/// All wire commands the client understands. Anything else is carried as `Raw`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Peer identity announcement.
    MyNick(String),
    /// Handshake challenge. `pk` is the optional `Pk=` suffix.
    Lock { lock: String, pk: Option<String> },
    /// Handshake response; the key is binary-safe.
    Key(Vec<u8>),
    Supports(Vec<String>),
    /// `$Direction Download|Upload <number>`.
    Direction { direction: String, number: u32 },
    ValidateNick(String),
    Version(String),
    /// Presence and share broadcast.
    MyInfo {
        nick: String,
        description: String,
        connection: String,
        email: String,
        share_size: u64,
    },
    /// Authentication complete. Hubs send either `$Hello|` or `$Hello <nick>|`.
    Hello(Option<String>),
    /// Hub rejected the nick.
    ValidateDenide(String),
    /// Hub wants a password (registered nick).
    GetPass,
    BadPass,
    /// Ask `nick` to open a connection to our active endpoint.
    ConnectToMe { nick: String, address: String },
    /// A raw payload of `bytes` length follows this line.
    AdcSnd {
        kind: String,
        name: String,
        start: u64,
        bytes: u64,
    },
    /// Chat or any command not modelled above, without its terminator.
    Raw(String),
}

impl Command {
    /// Parse one received line. The trailing `|` is optional.
    pub fn parse(line: &str) -> Result<Command, CommandError> {
        let line = line.strip_suffix('|').unwrap_or(line);
        if !line.starts_with('$') {
            return Ok(Command::Raw(line.to_string()));
        }
        let (name, rest) = match line.split_once(' ') {
            Some((n, r)) => (n, r),
            None => (line, ""),
        };
        let cmd = match name {
            "$MyNick" => Command::MyNick(first_field(name, rest)?.to_string()),
            "$Lock" => {
                let (lock, pk) = match rest.split_once(" Pk=") {
                    Some((l, p)) => (l, Some(p.to_string())),
                    None => (rest, None),
                };
                Command::Lock {
                    lock: first_field(name, lock)?.to_string(),
                    pk,
                }
            }
            "$Key" => Command::Key(rest.as_bytes().to_vec()),
            "$Supports" => Command::Supports(rest.split_whitespace().map(String::from).collect()),
            "$Direction" => {
                let mut it = rest.split_whitespace();
                let direction = it.next().ok_or_else(|| missing(name, "direction"))?;
                let number = it.next().ok_or_else(|| missing(name, "number"))?;
                Command::Direction {
                    direction: direction.to_string(),
                    number: parse_number(name, "number", number)?,
                }
            }
            "$ValidateNick" => Command::ValidateNick(first_field(name, rest)?.to_string()),
            "$Version" => Command::Version(first_field(name, rest)?.to_string()),
            "$MyINFO" => parse_my_info(rest)?,
            "$Hello" => Command::Hello(rest.split_whitespace().next().map(String::from)),
            "$ValidateDenide" => Command::ValidateDenide(rest.trim().to_string()),
            "$GetPass" => Command::GetPass,
            "$BadPass" => Command::BadPass,
            "$ConnectToMe" => {
                let mut it = rest.split_whitespace();
                let nick = it.next().ok_or_else(|| missing(name, "nick"))?;
                let address = it.next().ok_or_else(|| missing(name, "address"))?;
                Command::ConnectToMe {
                    nick: nick.to_string(),
                    address: address.to_string(),
                }
            }
            "$ADCSND" => {
                let fields: Vec<&str> = rest.split(' ').collect();
                if fields.len() < 4 {
                    return Err(missing(name, "bytes"));
                }
                Command::AdcSnd {
                    kind: fields[0].to_string(),
                    name: fields[1].to_string(),
                    start: parse_number(name, "start", fields[2])?,
                    bytes: parse_number(name, "bytes", fields[3])?,
                }
            }
            _ => Command::Raw(line.to_string()),
        };
        Ok(cmd)
    }

    /// Parse a received line that need not be UTF-8. `$Key` keeps its raw bytes;
    /// anything else is decoded lossily.
    pub fn parse_bytes(line: &[u8]) -> Result<Command, CommandError> {
        let body = line.strip_suffix(b"|").unwrap_or(line);
        if let Some(key) = body.strip_prefix(b"$Key ") {
            return Ok(Command::Key(key.to_vec()));
        }
        Command::parse(&String::from_utf8_lossy(line))
    }

    /// Render as a `|`-terminated line.
    pub fn to_bytes(&self) -> Vec<u8> {
        let text = match self {
            Command::MyNick(nick) => format!("$MyNick {}", nick),
            Command::Lock { lock, pk: Some(pk) } => format!("$Lock {} Pk={}", lock, pk),
            Command::Lock { lock, pk: None } => format!("$Lock {}", lock),
            Command::Key(key) => {
                let mut out = b"$Key ".to_vec();
                out.extend_from_slice(key);
                out.push(b'|');
                return out;
            }
            Command::Supports(features) => format!("$Supports {}", features.join(" ")),
            Command::Direction { direction, number } => {
                format!("$Direction {} {}", direction, number)
            }
            Command::ValidateNick(nick) => format!("$ValidateNick {}", nick),
            Command::Version(v) => format!("$Version {}", v),
            Command::MyInfo {
                nick,
                description,
                connection,
                email,
                share_size,
            } => format!(
                "$MyINFO $ALL {} {}$ ${}${}${}$",
                nick, description, connection, email, share_size
            ),
            Command::Hello(Some(nick)) => format!("$Hello {}", nick),
            Command::Hello(None) => "$Hello".to_string(),
            Command::ValidateDenide(nick) => format!("$ValidateDenide {}", nick),
            Command::GetPass => "$GetPass".to_string(),
            Command::BadPass => "$BadPass".to_string(),
            Command::ConnectToMe { nick, address } => format!("$ConnectToMe {} {}", nick, address),
            Command::AdcSnd {
                kind,
                name,
                start,
                bytes,
            } => format!("$ADCSND {} {} {} {}", kind, name, start, bytes),
            Command::Raw(text) => text.clone(),
        };
        let mut out = text.into_bytes();
        out.push(b'|');
        out
    }

    /// `$MyINFO` as this client announces itself: active mode, one hub, three slots.
    pub fn my_info(nick: &str, share_size: u64) -> Command {
        Command::MyInfo {
            nick: nick.to_string(),
            description: CLIENT_TAG.to_string(),
            connection: "10^Q".to_string(),
            email: String::new(),
            share_size,
        }
    }

    /// `$Supports` as this client announces itself to peers.
    pub fn peer_supports() -> Command {
        Command::Supports(PEER_FEATURES.iter().map(|f| f.to_string()).collect())
    }
}

/// Error parsing a received command.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("{0}: missing {1}")]
    MissingField(String, &'static str),
    #[error("{command}: invalid {field} {value:?}")]
    InvalidNumber {
        command: String,
        field: &'static str,
        value: String,
    },
}

fn missing(command: &str, field: &'static str) -> CommandError {
    CommandError::MissingField(command.to_string(), field)
}

fn first_field<'a>(command: &str, rest: &'a str) -> Result<&'a str, CommandError> {
    rest.split_whitespace()
        .next()
        .ok_or_else(|| missing(command, "argument"))
}

fn parse_number<T: std::str::FromStr>(
    command: &str,
    field: &'static str,
    value: &str,
) -> Result<T, CommandError> {
    value.parse().map_err(|_| CommandError::InvalidNumber {
        command: command.to_string(),
        field,
        value: value.to_string(),
    })
}

// $MyINFO $ALL <nick> <description>$ $<connection><flag>$<email>$<share>$
fn parse_my_info(rest: &str) -> Result<Command, CommandError> {
    const NAME: &str = "$MyINFO";
    let rest = rest
        .strip_prefix("$ALL ")
        .ok_or_else(|| missing(NAME, "$ALL"))?;
    let (nick, info) = rest.split_once(' ').unwrap_or((rest, ""));
    let parts: Vec<&str> = info.split('$').collect();
    let share = parts.get(4).copied().unwrap_or("").trim();
    let share_size = if share.is_empty() {
        0
    } else {
        parse_number(NAME, "share size", share)?
    };
    Ok(Command::MyInfo {
        nick: nick.to_string(),
        description: parts.first().copied().unwrap_or("").to_string(),
        connection: parts.get(2).copied().unwrap_or("").to_string(),
        email: parts.get(3).copied().unwrap_or("").to_string(),
        share_size,
    })
}
