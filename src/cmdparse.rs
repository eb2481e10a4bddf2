use thiserror::Error;

use crate::iptables::{Registry, Rule, ANY_ADDR, ANY_IFACE};
use crate::iputil;
use crate::timeutil;

#[derive(Error, Debug)]
#[error("Incorrect path: {path}. {msg}")]
pub struct PathError {
    pub path: String,
    pub msg: String,
}

impl PathError {
    fn new(path: &str, msg: impl Into<String>) -> PathError {
        PathError {
            path: path.to_string(),
            msg: msg.into(),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RuleParseError {
    #[error("Not enough details to construct the rule")]
    NotEnoughDetails,
    #[error("The action should be one of the known targets")]
    UnknownTarget,
    #[error("When not creating one, the chain should be one of the known chains")]
    UnknownChain,
    #[error("Interface name too long. Max 16 characters")]
    IfaceTooLong,
    #[error("Incorrect IP endpoint")]
    BadEndpoint,
    #[error("Incorrect IP endpoint or netmask")]
    BadSecondEndpoint,
    #[error("Netmask must be in range from 9 to 32")]
    MaskOutOfRange,
    #[error("Incorrect netmask value")]
    BadMask,
    #[error("Too many details for the {0} chain")]
    TooManyDetails(String),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DirectiveError {
    #[error("Incorrect expire parameter value")]
    BadExpire,
    #[error("Incorrect wait parameter value")]
    BadWait,
    #[error("Incorrect modify parameter value")]
    BadModify,
}

/// The parsed command path: the usage page, a listing (optionally filtered
/// to one chain), or a concrete rule mutation.
#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Help,
    List(Option<String>),
    Rule(Rule),
}

/// Query-string directives accompanying a command. Unknown keys are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directives {
    /// Expiry in seconds; `0` means permanent.
    pub expire: Option<u64>,
    /// Advisory request to block until the rule is applied.
    pub wait: bool,
    /// Verb override for GET requests when non-RESTful mode is enabled.
    pub modify: Option<ModifyOverride>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyOverride {
    Insert,
    Delete,
}

/// Convert an interface path segment to the utility's naming: `any` means
/// every interface, and a name without a trailing digit gets the kernel's
/// prefix-match quantifier (`eth` matches `eth0`, `eth1`, ...).
fn convert_iface(iface: &str) -> String {
    if iface == "any" {
        return ANY_IFACE.to_string();
    }
    match iface.chars().last() {
        Some(c) if c.is_ascii_digit() => iface.to_string(),
        _ => format!("{}+", iface),
    }
}

pub fn parse_command_path(path: &str, registry: &Registry) -> Result<Command, PathError> {
    let trimmed = path.trim().to_lowercase();
    if !trimmed.starts_with('/') {
        return Err(PathError::new(path, ""));
    }
    let trimmed = trimmed.strip_suffix('/').unwrap_or(&trimmed);
    let parts: Vec<String> = trimmed
        .split('/')
        .skip(1)
        .map(|s| s.trim().to_string())
        .collect();

    if parts.is_empty() {
        return Ok(Command::Help);
    }

    let action = parts[0].as_str();

    if registry.is_target(&action.to_uppercase()) {
        return build_rule(&parts, registry)
            .map(Command::Rule)
            .map_err(|e| PathError::new(path, e.to_string()));
    }

    if action == "list" {
        return match parts.len() {
            1 => Ok(Command::List(None)),
            2 => {
                let chain = parts[1].to_uppercase();
                if registry.is_chain(&chain) {
                    Ok(Command::List(Some(chain)))
                } else {
                    Err(PathError::new(path, "Wrong chain name for list command"))
                }
            }
            _ => Err(PathError::new(path, "Too many details for the list command")),
        };
    }

    Err(PathError::new(path, ""))
}

fn checked_iface(segment: &str) -> Result<String, RuleParseError> {
    if segment.len() > 16 {
        return Err(RuleParseError::IfaceTooLong);
    }
    Ok(convert_iface(segment))
}

/// Build a rule from the path segments of a mutation command, e.g.
/// `["drop", "input", "eth0", "1.2.3.4"]`.
fn build_rule(p: &[String], registry: &Registry) -> Result<Rule, RuleParseError> {
    let target = p[0].to_uppercase();
    if !registry.is_target(&target) {
        return Err(RuleParseError::UnknownTarget);
    }
    if p.len() < 2 {
        return Err(RuleParseError::NotEnoughDetails);
    }
    let chain = p[1].to_uppercase();
    if target != "CREATE" && !registry.is_chain(&chain) {
        return Err(RuleParseError::UnknownChain);
    }
    // A mutation other than chain management needs an interface and an
    // endpoint to act on.
    if target != "CREATE" && p.len() < 4 {
        return Err(RuleParseError::NotEnoughDetails);
    }

    let mut iface1 = None;
    let mut ip1 = None;
    let mut port1 = None;
    if p.len() > 2 {
        iface1 = Some(checked_iface(&p[2])?);
    }
    if p.len() > 3 {
        let endpoint =
            iputil::extract_endpoint(&p[3]).map_err(|_| RuleParseError::BadEndpoint)?;
        ip1 = Some(endpoint.addr.ok_or(RuleParseError::BadEndpoint)?);
        port1 = endpoint.port;
    }

    // Positional tail: an all-digit segment right after the endpoint is a
    // netmask, then optionally a second interface, endpoint and netmask.
    let mut mask1 = None;
    let mut iface2 = None;
    let mut ip2 = None;
    let mut port2 = None;
    let mut mask2 = None;
    if p.len() > 4 {
        let mut i = 4;
        if p[i].bytes().all(|b| b.is_ascii_digit()) {
            if !iputil::validate_mask_limit(&p[i]) {
                return Err(RuleParseError::MaskOutOfRange);
            }
            mask1 = Some(p[i].clone());
            i += 1;
        }
        if p.len() > i {
            iface2 = Some(checked_iface(&p[i])?);
            i += 1;
            if p.len() > i {
                let endpoint = iputil::extract_endpoint(&p[i])
                    .map_err(|_| RuleParseError::BadSecondEndpoint)?;
                ip2 = Some(
                    endpoint
                        .addr
                        .ok_or(RuleParseError::BadSecondEndpoint)?,
                );
                port2 = endpoint.port;
                i += 1;
                if p.len() > i {
                    if !iputil::validate_mask_limit(&p[i]) {
                        return Err(RuleParseError::BadMask);
                    }
                    mask2 = Some(p[i].clone());
                }
            }
        }
    }

    if chain == "INPUT" || chain == "OUTPUT" {
        if p.len() > 5 {
            return Err(RuleParseError::TooManyDetails(chain));
        }
        if p.len() > 4 && mask1.is_none() {
            return Err(RuleParseError::BadMask);
        }
    }
    if chain == "FORWARD" {
        if p.len() > 8 {
            return Err(RuleParseError::TooManyDetails(chain));
        }
        if p.len() > 7 && (mask1.is_none() || mask2.is_none()) {
            return Err(RuleParseError::BadMask);
        }
        if p.len() > 6 && mask1.is_none() && mask2.is_none() {
            return Err(RuleParseError::BadMask);
        }
    }

    let mut extra = String::new();
    let mut prot = "all".to_string();
    let append_port = |extra: &mut String, prot: &mut String, tag: &str, port: u16| {
        if !extra.contains("tcp") {
            *extra = format!("tcp {}", extra).trim_end().to_string();
        }
        *extra = format!("{} {}:{}", extra, tag, port);
        *prot = "tcp".to_string();
    };

    let inp;
    let out;
    let mut source = ANY_ADDR.to_string();
    let mut destination = ANY_ADDR.to_string();

    let with_mask = |ip: std::net::Ipv4Addr, mask: &Option<String>| match mask {
        Some(m) => format!("{}/{}", ip, m),
        None => ip.to_string(),
    };

    if chain == "INPUT" {
        inp = iface1.unwrap_or_else(|| ANY_IFACE.to_string());
        out = ANY_IFACE.to_string();
        if let Some(ip) = ip1 {
            source = with_mask(ip, &mask1);
        }
        if let Some(port) = port1 {
            append_port(&mut extra, &mut prot, "spt", port);
        }
    } else if chain == "OUTPUT" {
        inp = ANY_IFACE.to_string();
        out = iface1.unwrap_or_else(|| ANY_IFACE.to_string());
        if let Some(ip) = ip1 {
            destination = with_mask(ip, &mask1);
        }
        if let Some(port) = port1 {
            append_port(&mut extra, &mut prot, "dpt", port);
        }
    } else if chain == "FORWARD" {
        inp = iface1.unwrap_or_else(|| ANY_IFACE.to_string());
        out = iface2.unwrap_or_else(|| ANY_IFACE.to_string());
        if let Some(ip) = ip1 {
            source = with_mask(ip, &mask1);
        }
        if let Some(ip) = ip2 {
            destination = with_mask(ip, &mask2);
        }
        if let Some(port) = port1 {
            append_port(&mut extra, &mut prot, "spt", port);
        }
        if let Some(port) = port2 {
            append_port(&mut extra, &mut prot, "dpt", port);
        }
    } else if target == "CREATE" {
        inp = iface1.clone().unwrap_or_else(|| ANY_IFACE.to_string());
        out = iface1.unwrap_or_else(|| ANY_IFACE.to_string());
    } else {
        // user-defined chain
        inp = iface1.unwrap_or_else(|| ANY_IFACE.to_string());
        out = iface2.unwrap_or_else(|| ANY_IFACE.to_string());
        if let Some(ip) = ip1 {
            source = with_mask(ip, &mask1);
        }
        if let Some(ip) = ip2 {
            destination = with_mask(ip, &mask2);
        }
        if let Some(port) = port1 {
            append_port(&mut extra, &mut prot, "spt", port);
        }
        if let Some(port) = port2 {
            append_port(&mut extra, &mut prot, "dpt", port);
        }
    }

    // Source NAT carries its translation address in the extra field; the
    // destination column goes back to the any-sentinel.
    if target == "SNAT" {
        extra = format!("{} to:{}", extra, destination)
            .trim_start()
            .to_string();
        destination = ANY_ADDR.to_string();
    }

    Ok(Rule {
        chain,
        target: Some(target),
        prot,
        inp,
        out,
        source,
        destination,
        extra,
        ..Rule::default()
    })
}

pub fn parse_command_query(query: &str) -> Result<Directives, DirectiveError> {
    let mut directives = Directives::default();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "expire" => {
                directives.expire = Some(
                    timeutil::parse_interval(&value).ok_or(DirectiveError::BadExpire)?,
                );
            }
            "wait" => {
                if value.to_lowercase() == "true" {
                    directives.wait = true;
                } else {
                    return Err(DirectiveError::BadWait);
                }
            }
            "modify" => {
                directives.modify = match value.to_lowercase().as_str() {
                    "insert" => Some(ModifyOverride::Insert),
                    "delete" => Some(ModifyOverride::Delete),
                    _ => return Err(DirectiveError::BadModify),
                };
            }
            _ => {}
        }
    }
    Ok(directives)
}

/// Parse the path and query of a request URL into a command and its
/// directives. The path names the rule, the query carries service parameters
/// like `expire`.
pub fn parse_command(
    path: &str,
    query: &str,
    registry: &Registry,
) -> Result<(Command, Directives), PathError> {
    let command = parse_command_path(path, registry)?;
    let directives =
        parse_command_query(query).map_err(|e| PathError::new(path, e.to_string()))?;
    Ok((command, directives))
}
