//! Events of the kernel `kmem` trace system that describe slab allocations.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Kmalloc,
    KmallocNode,
    KmemCacheAlloc,
    KmemCacheAllocNode,
    Kfree,
    KmemCacheFree,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::Kmalloc,
        EventKind::KmallocNode,
        EventKind::KmemCacheAlloc,
        EventKind::KmemCacheAllocNode,
        EventKind::Kfree,
        EventKind::KmemCacheFree,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        // trace-cmd may prefix the system name
        let name = name.strip_prefix("kmem/").unwrap_or(name);
        match name {
            "kmalloc" => Some(EventKind::Kmalloc),
            "kmalloc_node" => Some(EventKind::KmallocNode),
            "kmem_cache_alloc" => Some(EventKind::KmemCacheAlloc),
            "kmem_cache_alloc_node" => Some(EventKind::KmemCacheAllocNode),
            "kfree" => Some(EventKind::Kfree),
            "kmem_cache_free" => Some(EventKind::KmemCacheFree),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EventKind::Kmalloc => "kmalloc",
            EventKind::KmallocNode => "kmalloc_node",
            EventKind::KmemCacheAlloc => "kmem_cache_alloc",
            EventKind::KmemCacheAllocNode => "kmem_cache_alloc_node",
            EventKind::Kfree => "kfree",
            EventKind::KmemCacheFree => "kmem_cache_free",
        }
    }

    /// Variants that carry a NUMA node hint.
    pub fn is_node_variant(self) -> bool {
        matches!(self, EventKind::KmallocNode | EventKind::KmemCacheAllocNode)
    }

    pub fn is_free(self) -> bool {
        matches!(self, EventKind::Kfree | EventKind::KmemCacheFree)
    }
}

/// Where an allocation was requested from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallSite {
    /// Raw instruction pointer, still to be symbolized.
    Address(u64),
    /// Already symbolized by the kernel (`%pS`), offset stripped.
    Symbol(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocEvent {
    pub call_site: CallSite,
    pub ptr: u64,
    pub bytes_req: u64,
    pub bytes_alloc: u64,
    pub node: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeEvent {
    pub ptr: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Alloc(AllocEvent),
    Free(FreeEvent),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KmemEvent {
    pub kind: EventKind,
    pub payload: Payload,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FieldError {
    #[error("{event}: missing field `{field}`")]
    Missing {
        event: &'static str,
        field: &'static str,
    },
    #[error("{event}: bad value `{value}` for field `{field}`")]
    Invalid {
        event: &'static str,
        field: &'static str,
        value: String,
    },
}

impl KmemEvent {
    /// Decodes the `key=value` list that follows the event name in a
    /// rendered trace line.
    pub fn parse(kind: EventKind, fields: &str) -> Result<Self, FieldError> {
        let fields = Fields {
            event: kind.name(),
            raw: fields,
        };

        let payload = if kind.is_free() {
            Payload::Free(FreeEvent {
                ptr: fields.hex("ptr")?,
            })
        } else {
            let node = match fields.get("node") {
                Some(node) => Some(node.parse().map_err(|_| fields.invalid("node", node))?),
                None => None,
            };
            Payload::Alloc(AllocEvent {
                call_site: fields.call_site()?,
                ptr: fields.hex("ptr")?,
                bytes_req: fields.decimal("bytes_req")?,
                bytes_alloc: fields.decimal("bytes_alloc")?,
                node,
            })
        };

        Ok(KmemEvent { kind, payload })
    }
}

struct Fields<'a> {
    event: &'static str,
    raw: &'a str,
}

impl<'a> Fields<'a> {
    fn get(&self, key: &str) -> Option<&'a str> {
        self.raw
            .split_whitespace()
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    fn require(&self, key: &'static str) -> Result<&'a str, FieldError> {
        self.get(key).ok_or(FieldError::Missing {
            event: self.event,
            field: key,
        })
    }

    fn invalid(&self, field: &'static str, value: &str) -> FieldError {
        FieldError::Invalid {
            event: self.event,
            field,
            value: value.to_string(),
        }
    }

    fn hex(&self, key: &'static str) -> Result<u64, FieldError> {
        let value = self.require(key)?;
        parse_hex(value).ok_or_else(|| self.invalid(key, value))
    }

    /// Byte counts, capped at `i64::MAX` so they stay exact in signed totals.
    fn decimal(&self, key: &'static str) -> Result<u64, FieldError> {
        let value = self.require(key)?;
        value
            .parse::<i64>()
            .ok()
            .and_then(|bytes| u64::try_from(bytes).ok())
            .ok_or_else(|| self.invalid(key, value))
    }

    fn call_site(&self) -> Result<CallSite, FieldError> {
        let value = self.require("call_site")?;
        if !value.contains('+') {
            if let Some(addr) = parse_hex(value) {
                return Ok(CallSite::Address(addr));
            }
        }
        // `__alloc_skb+0x8c/0x1e0`, module symbols carry a trailing ` [ext4]` token
        let symbol = value.split('+').next().unwrap_or(value);
        if symbol.is_empty() {
            return Err(self.invalid("call_site", value));
        }
        Ok(CallSite::Symbol(symbol.to_string()))
    }
}

fn parse_hex(value: &str) -> Option<u64> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}
