//! Response parsers for the IP lookup services used as probe targets

use std::fmt::Debug;
use std::sync::Arc;

use serde_json::Value;

use crate::models::GeoInfo;

/// Extracts exit IP and location from a probe response body
pub trait ResponseParser: Debug + Send + Sync {
    fn parse(&self, body: &str) -> Option<GeoInfo>;
}

/// Pick the parser matching a probe target host
pub fn parser_for_host(host: &str) -> Option<Arc<dyn ResponseParser>> {
    let host = host.trim_end_matches('.').to_lowercase();
    let parser: Arc<dyn ResponseParser> = match host.as_str() {
        "httpbin.org" => Arc::new(HttpBinParser),
        "api.ipify.org" => Arc::new(IpifyParser),
        "ip-api.com" => Arc::new(IpApiParser),
        "ifconfig.co" => Arc::new(IfconfigParser),
        "api.myip.com" => Arc::new(MyIpParser),
        _ => return None,
    };
    Some(parser)
}

fn json(body: &str) -> Option<Value> {
    serde_json::from_str(body.trim()).ok()
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// `{"origin": "1.2.3.4, 5.6.7.8"}`
#[derive(Debug)]
pub struct HttpBinParser;

impl ResponseParser for HttpBinParser {
    fn parse(&self, body: &str) -> Option<GeoInfo> {
        let value = json(body)?;
        let origin = string_field(&value, "origin")?;
        // Chained proxies list every hop; the first is the one we dialed
        let first = origin.split(',').next()?.trim().to_string();
        Some(GeoInfo {
            external_ip: Some(first),
            ..GeoInfo::default()
        })
    }
}

/// `{"ip": "1.2.3.4"}`
#[derive(Debug)]
pub struct IpifyParser;

impl ResponseParser for IpifyParser {
    fn parse(&self, body: &str) -> Option<GeoInfo> {
        let value = json(body)?;
        Some(GeoInfo {
            external_ip: Some(string_field(&value, "ip")?),
            ..GeoInfo::default()
        })
    }
}

#[derive(Debug)]
pub struct IpApiParser;

impl ResponseParser for IpApiParser {
    fn parse(&self, body: &str) -> Option<GeoInfo> {
        let value = json(body)?;
        if value.get("status").and_then(Value::as_str) == Some("fail") {
            return None;
        }
        Some(GeoInfo {
            external_ip: string_field(&value, "query"),
            country: string_field(&value, "country"),
            country_code: string_field(&value, "countryCode"),
        })
    }
}

#[derive(Debug)]
pub struct IfconfigParser;

impl ResponseParser for IfconfigParser {
    fn parse(&self, body: &str) -> Option<GeoInfo> {
        let value = json(body)?;
        Some(GeoInfo {
            external_ip: string_field(&value, "ip"),
            country: string_field(&value, "country"),
            country_code: string_field(&value, "country_iso"),
        })
    }
}

#[derive(Debug)]
pub struct MyIpParser;

impl ResponseParser for MyIpParser {
    fn parse(&self, body: &str) -> Option<GeoInfo> {
        let value = json(body)?;
        Some(GeoInfo {
            external_ip: string_field(&value, "ip"),
            country: string_field(&value, "country"),
            country_code: string_field(&value, "cc"),
        })
    }
}
