//! View-window request model and query binding.
//!
//! A view-window request names the spatial region, resolution level,
//! quality layers and components of an image the client currently cares
//! about. On the wire it is a query string over a fixed key set, identical
//! for the WebSocket request payload and the HTTP fallback:
//!
//! `target, cid, cnew, len, layers, meta, fsiz, rsiz, roff, comps,
//! reslevels, pref`
//!
//! `fsiz`/`rsiz` are `"w,h"` pairs, `roff` is `"x,y"`, `comps` is a
//! comma-separated integer list and `meta=yes` toggles metadata-only.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// A view-window request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewWindowRequest {
    /// Server-side image identifier
    pub target: Option<String>,

    /// Existing channel to bind to
    pub channel_id: Option<String>,

    /// Requested transport for a new channel; presence requests creation
    pub new_channel: Option<String>,

    /// Maximum response byte length
    pub max_length: Option<u64>,

    /// Number of quality layers wanted
    pub quality_layers: Option<u32>,

    /// Deliver only metadata bins
    pub metadata_only: bool,

    /// Full image size the client believes, `(w, h)`
    pub full_size: Option<(u32, u32)>,

    /// Region size `(w, h)`
    pub region_size: Option<(u32, u32)>,

    /// Region offset `(x, y)`
    pub region_offset: Option<(u32, u32)>,

    /// Component indices wanted
    pub components: Option<Vec<u32>>,

    /// Resolution level wanted
    pub resolution_level: Option<u32>,

    /// Block-coding preference (`htj2k` or `j2k`)
    pub preference: Option<String>,
}

impl ViewWindowRequest {
    /// Start a request for a target image.
    pub fn for_target(target: impl Into<String>) -> Self {
        Self {
            target: Some(target.into()),
            ..Default::default()
        }
    }

    pub fn with_region(mut self, offset: (u32, u32), size: (u32, u32)) -> Self {
        self.region_offset = Some(offset);
        self.region_size = Some(size);
        self
    }

    pub fn with_resolution_level(mut self, level: u32) -> Self {
        self.resolution_level = Some(level);
        self
    }

    pub fn with_quality_layers(mut self, layers: u32) -> Self {
        self.quality_layers = Some(layers);
        self
    }

    pub fn with_new_channel(mut self, transport: impl Into<String>) -> Self {
        self.new_channel = Some(transport.into());
        self
    }

    pub fn metadata_only(mut self) -> Self {
        self.metadata_only = true;
        self
    }

    /// Whether this request asks for channel creation.
    pub fn wants_new_channel(&self) -> bool {
        self.new_channel.is_some()
    }

    /// Region area in pixels, when a region is present.
    pub fn region_area(&self) -> Option<u64> {
        self.region_size
            .map(|(w, h)| u64::from(w) * u64::from(h))
    }

    /// Validate field combinations. An empty region is invalid.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if let Some((w, h)) = self.region_size {
            if w == 0 || h == 0 {
                return Err(ProtocolError::InvalidParameter {
                    field: "rsiz",
                    message: format!("empty region {w}x{h}"),
                });
            }
        }
        if let Some((w, h)) = self.full_size {
            if w == 0 || h == 0 {
                return Err(ProtocolError::InvalidParameter {
                    field: "fsiz",
                    message: format!("empty full size {w}x{h}"),
                });
            }
        }
        Ok(())
    }

    /// Encode as a query string with keys in canonical order.
    pub fn to_query(&self) -> String {
        let mut pairs: Vec<(&str, String)> = Vec::new();
        if let Some(target) = &self.target {
            pairs.push(("target", target.clone()));
        }
        if let Some(cid) = &self.channel_id {
            pairs.push(("cid", cid.clone()));
        }
        if let Some(cnew) = &self.new_channel {
            pairs.push(("cnew", cnew.clone()));
        }
        if let Some(len) = self.max_length {
            pairs.push(("len", len.to_string()));
        }
        if let Some(layers) = self.quality_layers {
            pairs.push(("layers", layers.to_string()));
        }
        if self.metadata_only {
            pairs.push(("meta", "yes".to_string()));
        }
        if let Some((w, h)) = self.full_size {
            pairs.push(("fsiz", format!("{w},{h}")));
        }
        if let Some((w, h)) = self.region_size {
            pairs.push(("rsiz", format!("{w},{h}")));
        }
        if let Some((x, y)) = self.region_offset {
            pairs.push(("roff", format!("{x},{y}")));
        }
        if let Some(comps) = &self.components {
            let list: Vec<String> = comps.iter().map(u32::to_string).collect();
            pairs.push(("comps", list.join(",")));
        }
        if let Some(level) = self.resolution_level {
            pairs.push(("reslevels", level.to_string()));
        }
        if let Some(pref) = &self.preference {
            pairs.push(("pref", pref.clone()));
        }

        pairs
            .iter()
            .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Decode from a query string. Unknown keys are ignored; key order is
    /// irrelevant.
    pub fn from_query(query: &str) -> Result<Self, ProtocolError> {
        let mut request = Self::default();
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, raw_value) = match pair.split_once('=') {
                Some((k, v)) => (k, v),
                None => (pair, ""),
            };
            let value = urlencoding::decode(raw_value)
                .map_err(|e| ProtocolError::InvalidParameter {
                    field: "query",
                    message: format!("bad escape in `{key}`: {e}"),
                })?
                .into_owned();

            match key {
                "target" => request.target = Some(value),
                "cid" => request.channel_id = Some(value),
                "cnew" => request.new_channel = Some(value),
                "len" => request.max_length = Some(parse_int(&value, "len")?),
                "layers" => request.quality_layers = Some(parse_int(&value, "layers")?),
                "meta" => request.metadata_only = value == "yes",
                "fsiz" => request.full_size = Some(parse_pair(&value, "fsiz")?),
                "rsiz" => request.region_size = Some(parse_pair(&value, "rsiz")?),
                "roff" => request.region_offset = Some(parse_pair(&value, "roff")?),
                "comps" => request.components = Some(parse_list(&value, "comps")?),
                "reslevels" => request.resolution_level = Some(parse_int(&value, "reslevels")?),
                "pref" => request.preference = Some(value),
                _ => {}
            }
        }
        Ok(request)
    }
}

fn parse_int<T: std::str::FromStr>(value: &str, field: &'static str) -> Result<T, ProtocolError> {
    value.parse().map_err(|_| ProtocolError::InvalidParameter {
        field,
        message: format!("not a non-negative integer: `{value}`"),
    })
}

fn parse_pair(value: &str, field: &'static str) -> Result<(u32, u32), ProtocolError> {
    let (a, b) = value
        .split_once(',')
        .ok_or_else(|| ProtocolError::InvalidParameter {
            field,
            message: format!("expected `a,b`, got `{value}`"),
        })?;
    Ok((parse_int(a.trim(), field)?, parse_int(b.trim(), field)?))
}

fn parse_list(value: &str, field: &'static str) -> Result<Vec<u32>, ProtocolError> {
    value
        .split(',')
        .filter(|s| !s.is_empty())
        .map(|s| parse_int(s.trim(), field))
        .collect()
}

/// Named request templates kept on the client.
///
/// Templates never reach the wire; instantiating one yields a plain request
/// the caller can adjust before sending.
#[derive(Debug, Default)]
pub struct RequestTemplates {
    templates: HashMap<String, ViewWindowRequest>,
}

impl RequestTemplates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, request: ViewWindowRequest) {
        self.templates.insert(name.into(), request);
    }

    pub fn instantiate(&self, name: &str) -> Option<ViewWindowRequest> {
        self.templates.get(name).cloned()
    }

    pub fn remove(&mut self, name: &str) -> Option<ViewWindowRequest> {
        self.templates.remove(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.templates.keys().map(String::as_str).collect()
    }
}
