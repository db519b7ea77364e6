// LDAP v3 protocol surface: application tag numbers, result codes and the
// response envelope builders used by the session loop.

use crate::ber::{BerClass, BerNode, BerValue, TAG_OCTET_STRING, TAG_SEQUENCE};

// Application tag numbers (RFC 4511), as carried on the operation node of an
// envelope. The tag alone classifies the operation.
pub const APP_BIND_REQUEST: u8 = 0;
pub const APP_BIND_RESPONSE: u8 = 1;
pub const APP_UNBIND_REQUEST: u8 = 2;
pub const APP_SEARCH_REQUEST: u8 = 3;
pub const APP_SEARCH_RESULT_ENTRY: u8 = 4;
pub const APP_SEARCH_RESULT_DONE: u8 = 5;
pub const APP_MODIFY_REQUEST: u8 = 6;
pub const APP_MODIFY_RESPONSE: u8 = 7;
pub const APP_ADD_REQUEST: u8 = 8;
pub const APP_ADD_RESPONSE: u8 = 9;
pub const APP_DEL_REQUEST: u8 = 10;
pub const APP_DEL_RESPONSE: u8 = 11;
pub const APP_MODIFY_DN_REQUEST: u8 = 12;
pub const APP_MODIFY_DN_RESPONSE: u8 = 13;
pub const APP_COMPARE_REQUEST: u8 = 14;
pub const APP_COMPARE_RESPONSE: u8 = 15;
pub const APP_ABANDON_REQUEST: u8 = 16;
pub const APP_EXTENDED_REQUEST: u8 = 23;
pub const APP_EXTENDED_RESPONSE: u8 = 24;

/// Recognized operation kinds. Anything else is "unsupported" and ends the
/// session after an error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Bind,
    Unbind,
    Search,
    Modify,
    Add,
    Delete,
    ModifyDn,
    Compare,
    Abandon,
    Extended,
}

impl OperationKind {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            APP_BIND_REQUEST => Some(OperationKind::Bind),
            APP_UNBIND_REQUEST => Some(OperationKind::Unbind),
            APP_SEARCH_REQUEST => Some(OperationKind::Search),
            APP_MODIFY_REQUEST => Some(OperationKind::Modify),
            APP_ADD_REQUEST => Some(OperationKind::Add),
            APP_DEL_REQUEST => Some(OperationKind::Delete),
            APP_MODIFY_DN_REQUEST => Some(OperationKind::ModifyDn),
            APP_COMPARE_REQUEST => Some(OperationKind::Compare),
            APP_ABANDON_REQUEST => Some(OperationKind::Abandon),
            APP_EXTENDED_REQUEST => Some(OperationKind::Extended),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            OperationKind::Bind => "bind",
            OperationKind::Unbind => "unbind",
            OperationKind::Search => "search",
            OperationKind::Modify => "modify",
            OperationKind::Add => "add",
            OperationKind::Delete => "delete",
            OperationKind::ModifyDn => "modify_dn",
            OperationKind::Compare => "compare",
            OperationKind::Abandon => "abandon",
            OperationKind::Extended => "extended",
        }
    }

    /// Response tag for the generic single-response operations. None for
    /// operations that answer with a dedicated shape or not at all.
    pub fn response_tag(self) -> Option<u8> {
        match self {
            OperationKind::Modify => Some(APP_MODIFY_RESPONSE),
            OperationKind::Add => Some(APP_ADD_RESPONSE),
            OperationKind::Delete => Some(APP_DEL_RESPONSE),
            OperationKind::ModifyDn => Some(APP_MODIFY_DN_RESPONSE),
            OperationKind::Compare => Some(APP_COMPARE_RESPONSE),
            OperationKind::Extended => Some(APP_EXTENDED_RESPONSE),
            _ => None,
        }
    }
}

/// LDAP result codes (RFC 4511 section 4.1.9 subset).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResultCode {
    Success = 0,
    OperationsError = 1,
    ProtocolError = 2,
    TimeLimitExceeded = 3,
    SizeLimitExceeded = 4,
    CompareFalse = 5,
    CompareTrue = 6,
    AuthMethodNotSupported = 7,
    StrongerAuthRequired = 8,
    NoSuchAttribute = 16,
    UndefinedAttributeType = 17,
    NoSuchObject = 32,
    InvalidDnSyntax = 34,
    InappropriateAuthentication = 48,
    InvalidCredentials = 49,
    InsufficientAccessRights = 50,
    Busy = 51,
    Unavailable = 52,
    UnwillingToPerform = 53,
    EntryAlreadyExists = 68,
    Other = 80,
}

impl ResultCode {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn text(self) -> &'static str {
        match self {
            ResultCode::Success => "Success",
            ResultCode::OperationsError => "Operations Error",
            ResultCode::ProtocolError => "Protocol Error",
            ResultCode::TimeLimitExceeded => "Time Limit Exceeded",
            ResultCode::SizeLimitExceeded => "Size Limit Exceeded",
            ResultCode::CompareFalse => "Compare False",
            ResultCode::CompareTrue => "Compare True",
            ResultCode::AuthMethodNotSupported => "Auth Method Not Supported",
            ResultCode::StrongerAuthRequired => "Stronger Auth Required",
            ResultCode::NoSuchAttribute => "No Such Attribute",
            ResultCode::UndefinedAttributeType => "Undefined Attribute Type",
            ResultCode::NoSuchObject => "No Such Object",
            ResultCode::InvalidDnSyntax => "Invalid DN Syntax",
            ResultCode::InappropriateAuthentication => "Inappropriate Authentication",
            ResultCode::InvalidCredentials => "Invalid Credentials",
            ResultCode::InsufficientAccessRights => "Insufficient Access Rights",
            ResultCode::Busy => "Busy",
            ResultCode::Unavailable => "Unavailable",
            ResultCode::UnwillingToPerform => "Unwilling To Perform",
            ResultCode::EntryAlreadyExists => "Entry Already Exists",
            ResultCode::Other => "Other",
        }
    }
}

/// Raw request control, collected from the optional third envelope child and
/// passed through to handlers untouched. Value semantics are the handlers'
/// concern.
#[derive(Debug, Clone)]
pub struct Control {
    pub oid: String,
    pub critical: bool,
    pub value: Option<Vec<u8>>,
}

/// Lenient per-entry control decode: first text child is the OID, a boolean
/// child is criticality, any later string child is the raw value.
pub fn decode_control(node: &BerNode) -> Control {
    let mut oid = String::new();
    let mut critical = false;
    let mut value = None;
    for (i, child) in node.children.iter().enumerate() {
        match &child.value {
            BerValue::Text(s) if i == 0 => oid = s.clone(),
            BerValue::Boolean(b) => critical = *b,
            BerValue::Text(_) => value = Some(child.content.clone()),
            _ => {}
        }
    }
    Control {
        oid,
        critical,
        value,
    }
}

fn envelope(message_id: u64, op: BerNode) -> BerNode {
    let mut msg = BerNode::sequence(BerClass::Universal, TAG_SEQUENCE);
    msg.append(BerNode::integer(
        BerClass::Universal,
        crate::ber::TAG_INTEGER,
        message_id as i64,
    ));
    msg.append(op);
    msg
}

/// Generic result envelope: enumerated code, empty matched DN, diagnostic
/// text. Used for every single-response operation (and, with the add-response
/// tag, for the unsupported-operation path).
pub fn operation_response(
    message_id: u64,
    response_tag: u8,
    code: ResultCode,
    text: &str,
) -> BerNode {
    let mut op = BerNode::sequence(BerClass::Application, response_tag);
    op.append(BerNode::enumerated(code.code() as i64));
    op.append(BerNode::octet_string(""));
    op.append(BerNode::octet_string(text));
    envelope(message_id, op)
}

pub fn bind_response(message_id: u64, code: ResultCode) -> BerNode {
    operation_response(message_id, APP_BIND_RESPONSE, code, "")
}

pub fn search_done(message_id: u64, code: ResultCode) -> BerNode {
    operation_response(message_id, APP_SEARCH_RESULT_DONE, code, "")
}

/// Search result entry envelope; entries are streamed by search handlers in
/// handler order, before the final search-done.
pub fn search_entry(message_id: u64, dn: &str, attributes: &[(String, Vec<String>)]) -> BerNode {
    let mut op = BerNode::sequence(BerClass::Application, APP_SEARCH_RESULT_ENTRY);
    op.append(BerNode::octet_string(dn));
    let mut attrs = BerNode::sequence(BerClass::Universal, TAG_SEQUENCE);
    for (name, values) in attributes {
        let mut attr = BerNode::sequence(BerClass::Universal, TAG_SEQUENCE);
        attr.append(BerNode::octet_string(name));
        let mut vals = BerNode::sequence(BerClass::Universal, TAG_SEQUENCE);
        for v in values {
            vals.append(BerNode::octet_string(v));
        }
        attr.append(vals);
        attrs.append(attr);
    }
    op.append(attrs);
    envelope(message_id, op)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ber::{self, BerType};

    #[test]
    fn test_classification_table() {
        assert_eq!(OperationKind::from_tag(0), Some(OperationKind::Bind));
        assert_eq!(OperationKind::from_tag(2), Some(OperationKind::Unbind));
        assert_eq!(OperationKind::from_tag(3), Some(OperationKind::Search));
        assert_eq!(OperationKind::from_tag(6), Some(OperationKind::Modify));
        assert_eq!(OperationKind::from_tag(8), Some(OperationKind::Add));
        assert_eq!(OperationKind::from_tag(10), Some(OperationKind::Delete));
        assert_eq!(OperationKind::from_tag(12), Some(OperationKind::ModifyDn));
        assert_eq!(OperationKind::from_tag(14), Some(OperationKind::Compare));
        assert_eq!(OperationKind::from_tag(16), Some(OperationKind::Abandon));
        assert_eq!(OperationKind::from_tag(23), Some(OperationKind::Extended));
        assert_eq!(OperationKind::from_tag(1), None);
        assert_eq!(OperationKind::from_tag(20), None);
    }

    #[test]
    fn test_response_tags() {
        assert_eq!(OperationKind::Add.response_tag(), Some(APP_ADD_RESPONSE));
        assert_eq!(OperationKind::Compare.response_tag(), Some(APP_COMPARE_RESPONSE));
        assert_eq!(OperationKind::Unbind.response_tag(), None);
        assert_eq!(OperationKind::Abandon.response_tag(), None);
    }

    #[test]
    fn test_bind_response_shape() {
        let resp = bind_response(7, ResultCode::InvalidCredentials);
        let parsed = ber::parse(&resp.to_bytes()).unwrap();
        assert_eq!(parsed.children[0].as_unsigned(), Some(7));
        let op = &parsed.children[1];
        assert_eq!(op.class, BerClass::Application);
        assert_eq!(op.tag, APP_BIND_RESPONSE);
        assert_eq!(op.ber_type, BerType::Constructed);
        assert_eq!(op.children[0].as_unsigned(), Some(49));
    }

    #[test]
    fn test_operation_response_carries_text() {
        let resp = operation_response(3, APP_ADD_RESPONSE, ResultCode::UnwillingToPerform,
            ResultCode::UnwillingToPerform.text());
        let parsed = ber::parse(&resp.to_bytes()).unwrap();
        let op = &parsed.children[1];
        assert_eq!(op.tag, APP_ADD_RESPONSE);
        assert_eq!(op.children[2].as_text(), Some("Unwilling To Perform"));
    }

    #[test]
    fn test_search_entry_shape() {
        let entry = search_entry(
            2,
            "cn=test,dc=example,dc=com",
            &[("cn".to_string(), vec!["test".to_string()])],
        );
        let parsed = ber::parse(&entry.to_bytes()).unwrap();
        let op = &parsed.children[1];
        assert_eq!(op.tag, APP_SEARCH_RESULT_ENTRY);
        assert_eq!(op.children[0].as_text(), Some("cn=test,dc=example,dc=com"));
        assert_eq!(op.children[1].children.len(), 1);
        assert_eq!(op.children[1].children[0].children[0].as_text(), Some("cn"));
    }

    #[test]
    fn test_decode_control() {
        let mut ctrl = BerNode::sequence(BerClass::Universal, TAG_SEQUENCE);
        ctrl.append(BerNode::octet_string("1.2.840.113556.1.4.319"));
        ctrl.append(BerNode::boolean(true));
        ctrl.append(BerNode::octet_string("cookie"));
        let decoded = decode_control(&ctrl);
        assert_eq!(decoded.oid, "1.2.840.113556.1.4.319");
        assert!(decoded.critical);
        assert_eq!(decoded.value.as_deref(), Some(&b"cookie"[..]));
    }

    #[test]
    fn test_decode_control_oid_only() {
        let mut ctrl = BerNode::sequence(BerClass::Universal, TAG_SEQUENCE);
        ctrl.append(BerNode::octet_string("2.16.840.1.113730.3.4.2"));
        let decoded = decode_control(&ctrl);
        assert_eq!(decoded.oid, "2.16.840.1.113730.3.4.2");
        assert!(!decoded.critical);
        assert!(decoded.value.is_none());
    }

    #[test]
    fn test_result_code_text() {
        assert_eq!(ResultCode::Success.text(), "Success");
        assert_eq!(ResultCode::OperationsError.code(), 1);
        assert_eq!(ResultCode::InvalidCredentials.code(), 49);
    }
}
