//! Values exchanged in RPC calls, and their XML-RPC encoding as the body of an HTTP POST.
//!
//! ```xml
//! <methodCall>
//!   <methodName>registerSubscriber</methodName>
//!   <params><param><value><string>/listener</string></value></param> ...</params>
//! </methodCall>
//! ```
//!
//! Every response carries exactly one value, the array `[status code, status message, payload]`.
//!  A value without a type element is a string.

use anyhow::{anyhow, bail};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use roxmltree::{Document, Node};

/// Nesting depth beyond which a received value is rejected rather than decoded recursively
const MAX_NESTING: usize = 32;

const XML_DECLARATION: &str = "<?xml version=\"1.0\"?>\n";

#[derive(Debug, Clone, PartialEq)]
pub enum RpcValue {
    Int(i32),
    Bool(bool),
    Double(f64),
    Str(String),
    Array(Vec<RpcValue>),
    /// members in the order they were received
    Struct(Vec<(String, RpcValue)>),
}

impl RpcValue {
    pub fn str(s: impl Into<String>) -> RpcValue {
        RpcValue::Str(s.into())
    }

    pub fn as_int(&self) -> anyhow::Result<i32> {
        match self {
            RpcValue::Int(i) => Ok(*i),
            other => Err(anyhow!("expected an int, was {:?}", other)),
        }
    }

    pub fn as_str(&self) -> anyhow::Result<&str> {
        match self {
            RpcValue::Str(s) => Ok(s),
            other => Err(anyhow!("expected a string, was {:?}", other)),
        }
    }

    pub fn as_array(&self) -> anyhow::Result<&[RpcValue]> {
        match self {
            RpcValue::Array(a) => Ok(a),
            other => Err(anyhow!("expected an array, was {:?}", other)),
        }
    }

    /// An array of strings, e.g. a URI list
    pub fn as_str_vec(&self) -> anyhow::Result<Vec<String>> {
        self.as_array()?
            .iter()
            .map(|v| v.as_str().map(|s| s.to_string()))
            .collect()
    }

    fn write_xml(&self, out: &mut String) {
        out.push_str("<value>");
        match self {
            RpcValue::Int(i) => out.push_str(&format!("<i4>{}</i4>", i)),
            RpcValue::Bool(b) => out.push_str(if *b { "<boolean>1</boolean>" } else { "<boolean>0</boolean>" }),
            RpcValue::Double(d) => out.push_str(&format!("<double>{}</double>", d)),
            RpcValue::Str(s) => {
                out.push_str("<string>");
                push_escaped(out, s);
                out.push_str("</string>");
            }
            RpcValue::Array(a) => {
                out.push_str("<array><data>");
                for v in a {
                    v.write_xml(out);
                }
                out.push_str("</data></array>");
            }
            RpcValue::Struct(members) => {
                out.push_str("<struct>");
                for (name, v) in members {
                    out.push_str("<member><name>");
                    push_escaped(out, name);
                    out.push_str("</name>");
                    v.write_xml(out);
                    out.push_str("</member>");
                }
                out.push_str("</struct>");
            }
        }
        out.push_str("</value>");
    }

    /// parses a `<value>` element
    fn from_xml_node(node: Node, depth: usize) -> anyhow::Result<RpcValue> {
        if depth > MAX_NESTING {
            bail!("RPC value nested deeper than {} levels", MAX_NESTING);
        }

        let Some(typed) = elements(node).next() else {
            return Ok(RpcValue::Str(text_of(node)));
        };

        match typed.tag_name().name() {
            "i4" | "int" => Ok(RpcValue::Int(text_of(typed).trim().parse()?)),
            "boolean" => match text_of(typed).trim() {
                "1" | "true" => Ok(RpcValue::Bool(true)),
                "0" | "false" => Ok(RpcValue::Bool(false)),
                other => Err(anyhow!("invalid boolean {:?}", other)),
            },
            "double" => Ok(RpcValue::Double(text_of(typed).trim().parse()?)),
            "string" => Ok(RpcValue::Str(text_of(typed))),
            "array" => {
                let data = child(typed, "data")?;
                let elements = elements(data)
                    .filter(|n| n.has_tag_name("value"))
                    .map(|v| RpcValue::from_xml_node(v, depth + 1))
                    .collect::<anyhow::Result<Vec<_>>>()?;
                Ok(RpcValue::Array(elements))
            }
            "struct" => {
                let members = elements(typed)
                    .filter(|n| n.has_tag_name("member"))
                    .map(|member| -> anyhow::Result<(String, RpcValue)> {
                        let name = text_of(child(member, "name")?);
                        let value = RpcValue::from_xml_node(child(member, "value")?, depth + 1)?;
                        Ok((name, value))
                    })
                    .collect::<anyhow::Result<Vec<_>>>()?;
                Ok(RpcValue::Struct(members))
            }
            other => Err(anyhow!("unsupported XML-RPC type <{}>", other)),
        }
    }
}

impl From<i32> for RpcValue {
    fn from(value: i32) -> Self {
        RpcValue::Int(value)
    }
}

impl From<bool> for RpcValue {
    fn from(value: bool) -> Self {
        RpcValue::Bool(value)
    }
}

impl From<&str> for RpcValue {
    fn from(value: &str) -> Self {
        RpcValue::Str(value.to_string())
    }
}

impl From<String> for RpcValue {
    fn from(value: String) -> Self {
        RpcValue::Str(value)
    }
}

impl <T: Into<RpcValue>> From<Vec<T>> for RpcValue {
    fn from(value: Vec<T>) -> Self {
        RpcValue::Array(value.into_iter().map(Into::into).collect())
    }
}

fn push_escaped(out: &mut String, s: &str) {
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c => out.push(c),
        }
    }
}

fn elements<'a, 'input>(node: Node<'a, 'input>) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children().filter(|n| n.is_element())
}

fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> anyhow::Result<Node<'a, 'input>> {
    elements(node)
        .find(|n| n.has_tag_name(name))
        .ok_or_else(|| anyhow!("<{}> has no <{}> element", node.tag_name().name(), name))
}

fn text_of(node: Node) -> String {
    node.descendants()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect()
}

fn parse_params(root: Node) -> anyhow::Result<Vec<RpcValue>> {
    let Some(params) = elements(root).find(|n| n.has_tag_name("params")) else {
        return Ok(Vec::new());
    };
    elements(params)
        .filter(|n| n.has_tag_name("param"))
        .map(|param| RpcValue::from_xml_node(child(param, "value")?, 0))
        .collect()
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum StatusCode {
    Error = -1,
    Failure = 0,
    Success = 1,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    pub method: String,
    pub args: Vec<RpcValue>,
}

impl RpcRequest {
    pub fn new(method: &str, args: Vec<RpcValue>) -> RpcRequest {
        RpcRequest {
            method: method.to_string(),
            args,
        }
    }

    pub fn to_xml(&self) -> String {
        let mut out = String::from(XML_DECLARATION);
        out.push_str("<methodCall><methodName>");
        push_escaped(&mut out, &self.method);
        out.push_str("</methodName><params>");
        for arg in &self.args {
            out.push_str("<param>");
            arg.write_xml(&mut out);
            out.push_str("</param>");
        }
        out.push_str("</params></methodCall>\n");
        out
    }

    pub fn from_xml(xml: &str) -> anyhow::Result<RpcRequest> {
        let doc = Document::parse(xml)?;
        let root = doc.root_element();
        if !root.has_tag_name("methodCall") {
            bail!("expected <methodCall>, was <{}>", root.tag_name().name());
        }

        let method = text_of(child(root, "methodName")?).trim().to_string();
        if method.is_empty() {
            bail!("empty method name");
        }
        Ok(RpcRequest {
            method,
            args: parse_params(root)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RpcResponse {
    pub code: StatusCode,
    pub message: String,
    pub payload: RpcValue,
}

impl RpcResponse {
    pub fn success(message: &str, payload: impl Into<RpcValue>) -> RpcResponse {
        RpcResponse {
            code: StatusCode::Success,
            message: message.to_string(),
            payload: payload.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> RpcResponse {
        RpcResponse {
            code: StatusCode::Failure,
            message: message.into(),
            payload: RpcValue::Int(0),
        }
    }

    pub fn error(message: impl Into<String>) -> RpcResponse {
        RpcResponse {
            code: StatusCode::Error,
            message: message.into(),
            payload: RpcValue::Int(0),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == StatusCode::Success
    }

    pub fn to_value(&self) -> RpcValue {
        RpcValue::Array(vec![
            RpcValue::Int(self.code.into()),
            RpcValue::str(&self.message),
            self.payload.clone(),
        ])
    }

    pub fn from_value(value: RpcValue) -> anyhow::Result<RpcResponse> {
        match value {
            RpcValue::Array(elements) if elements.len() == 3 => {
                let mut elements = elements.into_iter();
                let (code, message, payload) = match (elements.next(), elements.next(), elements.next()) {
                    (Some(c), Some(m), Some(p)) => (c, m, p),
                    _ => bail!("malformed RPC response"),
                };
                let code = StatusCode::try_from(code.as_int()?)
                    .map_err(|e| anyhow!("invalid status code: {}", e))?;
                Ok(RpcResponse {
                    code,
                    message: message.as_str()?.to_string(),
                    payload,
                })
            }
            other => Err(anyhow!("malformed RPC response: {:?}", other)),
        }
    }

    pub fn to_xml(&self) -> String {
        let mut out = String::from(XML_DECLARATION);
        out.push_str("<methodResponse><params><param>");
        self.to_value().write_xml(&mut out);
        out.push_str("</param></params></methodResponse>\n");
        out
    }

    /// An XML-RPC fault is reported as an error, it has no status code to map to
    pub fn from_xml(xml: &str) -> anyhow::Result<RpcResponse> {
        let doc = Document::parse(xml)?;
        let root = doc.root_element();
        if !root.has_tag_name("methodResponse") {
            bail!("expected <methodResponse>, was <{}>", root.tag_name().name());
        }

        if let Some(fault) = elements(root).find(|n| n.has_tag_name("fault")) {
            let fault = RpcValue::from_xml_node(child(fault, "value")?, 0)?;
            bail!("RPC fault: {:?}", fault);
        }

        let mut params = parse_params(root)?.into_iter();
        match (params.next(), params.next()) {
            (Some(value), None) => RpcResponse::from_value(value),
            _ => bail!("an RPC response must carry exactly one value"),
        }
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    fn value_xml(value: &RpcValue) -> String {
        let mut out = String::new();
        value.write_xml(&mut out);
        out
    }

    fn parse_value(xml: &str) -> anyhow::Result<RpcValue> {
        let doc = Document::parse(xml)?;
        RpcValue::from_xml_node(doc.root_element(), 0)
    }

    #[rstest]
    #[case::int(RpcValue::Int(-2), "<value><i4>-2</i4></value>")]
    #[case::bool(RpcValue::Bool(true), "<value><boolean>1</boolean></value>")]
    #[case::double(RpcValue::Double(2.5), "<value><double>2.5</double></value>")]
    #[case::str(RpcValue::str("a<b&c"), "<value><string>a&lt;b&amp;c</string></value>")]
    #[case::array(RpcValue::Array(vec![RpcValue::Int(1), RpcValue::Bool(false)]), "<value><array><data><value><i4>1</i4></value><value><boolean>0</boolean></value></data></array></value>")]
    #[case::empty_array(RpcValue::Array(vec![]), "<value><array><data></data></array></value>")]
    #[case::struct_(RpcValue::Struct(vec![("k".to_string(), RpcValue::Int(3))]), "<value><struct><member><name>k</name><value><i4>3</i4></value></member></struct></value>")]
    fn test_write_value(#[case] value: RpcValue, #[case] expected: &str) {
        assert_eq!(value_xml(&value), expected);
        assert_eq!(parse_value(expected).unwrap(), value);
    }

    #[rstest]
    #[case::int_tag("<value><int>7</int></value>", RpcValue::Int(7))]
    #[case::padded_int("<value><i4> 7 </i4></value>", RpcValue::Int(7))]
    #[case::untyped("<value>plain</value>", RpcValue::str("plain"))]
    #[case::empty_untyped("<value></value>", RpcValue::str(""))]
    #[case::empty_string("<value><string/></value>", RpcValue::str(""))]
    #[case::entities("<value><string>&lt;x&gt; &amp; &#65;</string></value>", RpcValue::str("<x> & A"))]
    #[case::bool_word("<value><boolean>false</boolean></value>", RpcValue::Bool(false))]
    #[case::pretty_printed("<value>\n  <array>\n    <data>\n      <value><i4>1</i4></value>\n    </data>\n  </array>\n</value>", RpcValue::Array(vec![RpcValue::Int(1)]))]
    fn test_parse_value(#[case] xml: &str, #[case] expected: RpcValue) {
        assert_eq!(parse_value(xml).unwrap(), expected);
    }

    #[rstest]
    #[case::unknown_type("<value><base64>AAAA</base64></value>")]
    #[case::invalid_int("<value><i4>x</i4></value>")]
    #[case::int_overflow("<value><i4>4294967296</i4></value>")]
    #[case::invalid_bool("<value><boolean>2</boolean></value>")]
    #[case::array_without_data("<value><array></array></value>")]
    #[case::member_without_name("<value><struct><member><value>x</value></member></struct></value>")]
    fn test_parse_value_invalid(#[case] xml: &str) {
        assert!(parse_value(xml).is_err());
    }

    #[test]
    fn test_parse_rejects_deep_nesting() {
        let mut value = RpcValue::Int(0);
        for _ in 0..(MAX_NESTING + 2) {
            value = RpcValue::Array(vec![value]);
        }
        assert!(parse_value(&value_xml(&value)).is_err());
    }

    #[test]
    fn test_request_xml() {
        let request = RpcRequest::new("lookupNode", vec!["/me".into(), "/talker".into()]);
        assert_eq!(request.to_xml(), "<?xml version=\"1.0\"?>\n<methodCall><methodName>lookupNode</methodName><params>\
            <param><value><string>/me</string></value></param>\
            <param><value><string>/talker</string></value></param>\
            </params></methodCall>\n");
        assert_eq!(RpcRequest::from_xml(&request.to_xml()).unwrap(), request);
    }

    #[test]
    fn test_request_without_params() {
        let request = RpcRequest::from_xml("<?xml version=\"1.0\"?><methodCall><methodName> getPid </methodName></methodCall>").unwrap();
        assert_eq!(request, RpcRequest::new("getPid", vec![]));
    }

    #[rstest]
    #[case::not_xml("getPid")]
    #[case::wrong_root("<methodResponse><params/></methodResponse>")]
    #[case::no_method_name("<methodCall><params/></methodCall>")]
    #[case::empty_method_name("<methodCall><methodName> </methodName></methodCall>")]
    #[case::param_without_value("<methodCall><methodName>x</methodName><params><param/></params></methodCall>")]
    fn test_request_invalid(#[case] xml: &str) {
        assert!(RpcRequest::from_xml(xml).is_err());
    }

    #[rstest]
    #[case(RpcResponse::success("ok", vec!["a", "b"]))]
    #[case(RpcResponse::failure("nope"))]
    #[case(RpcResponse::error("broken"))]
    fn test_response_xml(#[case] response: RpcResponse) {
        assert_eq!(RpcResponse::from_xml(&response.to_xml()).unwrap(), response);
    }

    #[test]
    fn test_response_from_registry() {
        let xml = "<?xml version='1.0'?>
<methodResponse>
<params>
<param>
<value><array><data>
<value><int>1</int></value>
<value><string>Subscribed to [/chatter]</string></value>
<value><array><data>
<value><string>http://talker:40181/</string></value>
</data></array></value>
</data></array></value>
</param>
</params>
</methodResponse>
";
        let response = RpcResponse::from_xml(xml).unwrap();
        assert!(response.is_success());
        assert_eq!(response.message, "Subscribed to [/chatter]");
        assert_eq!(response.payload.as_str_vec().unwrap(), vec!["http://talker:40181/".to_string()]);
    }

    #[rstest]
    #[case::fault("<methodResponse><fault><value><struct><member><name>faultCode</name><value><int>1</int></value></member></struct></value></fault></methodResponse>")]
    #[case::no_params("<methodResponse></methodResponse>")]
    #[case::two_params("<methodResponse><params><param><value>a</value></param><param><value>b</value></param></params></methodResponse>")]
    #[case::too_short("<methodResponse><params><param><value><array><data><value><i4>1</i4></value><value>x</value></data></array></value></param></params></methodResponse>")]
    #[case::invalid_code("<methodResponse><params><param><value><array><data><value><i4>7</i4></value><value>x</value><value><i4>0</i4></value></data></array></value></param></params></methodResponse>")]
    fn test_response_invalid(#[case] xml: &str) {
        assert!(RpcResponse::from_xml(xml).is_err());
    }

    #[test]
    fn test_as_str_vec() {
        let value: RpcValue = vec!["x", "y"].into();
        assert_eq!(value.as_str_vec().unwrap(), vec!["x".to_string(), "y".to_string()]);
        assert!(RpcValue::Array(vec![RpcValue::Int(1)]).as_str_vec().is_err());
    }
}
