//! Broker messages and reference opentypes.
//!
//! Top level:
//!
//! ```text
//! call    reqID target method (argName argValue)*   args sorted by name
//! answer  reqID value
//! error   reqID description
//! decref  clid
//! ```
//!
//! Nested: `my-reference clid [interface]` introduces one of the sender's
//! objects; `your-reference refID` hands one of the receiver's own objects
//! back to it.

use std::{any::Any, collections::BTreeMap, mem, sync::Arc};

use banana_core::{
    Constraint, Context, FixedSlicer, Object, ObjectRef, Registry, TokenType, UnbananaFailure,
    Unslicer, Value, Violation, registry::simple,
};
use bytes::Bytes;

use crate::{
    error::CallError,
    failure::Failure,
    reference::RefId,
    referenceable::{Referenceable, export},
    schema::{Arguments, InterfaceSchema, MethodSchema},
    state::{BrokerState, InboundCall},
};

/// Longest method, argument, or interface name accepted.
const MAX_NAME_LENGTH: u64 = 200;

/// Longest `error` description accepted.
const MAX_DESCRIPTION_LENGTH: u64 = 64 * 1024;

/// Opentype of a reference to an object owned by the sender.
pub(crate) const MY_REFERENCE: &str = "my-reference";

/// Constraint accepting a remote or returned local reference.
pub fn reference_constraint() -> Constraint {
    Constraint::Opentypes(vec![MY_REFERENCE, "your-reference"])
}

/// Outbound broker message.
#[derive(Debug)]
pub(crate) enum Message {
    Call { req_id: u64, target: RefId, method: String, args: BTreeMap<String, Value> },
    Answer { req_id: u64, value: Value },
    Error { req_id: u64, description: String },
    Decref { clid: u64 },
}

impl Message {
    pub(crate) fn into_value(self) -> Value {
        Value::Object(ObjectRef::new(Arc::new(self)))
    }

    pub(crate) fn slicer(&self) -> FixedSlicer {
        match self {
            Self::Call { req_id, target, method, args } => {
                let mut children = vec![Value::from(*req_id), target.to_value(), name(method)];
                for (arg, value) in args {
                    children.push(name(arg));
                    children.push(value.clone());
                }
                FixedSlicer::new("call", children)
            },
            Self::Answer { req_id, value } => {
                FixedSlicer::new("answer", vec![Value::from(*req_id), value.clone()])
            },
            Self::Error { req_id, description } => {
                FixedSlicer::new("error", vec![Value::from(*req_id), name(description)])
            },
            Self::Decref { clid } => FixedSlicer::new("decref", vec![Value::from(*clid)]),
        }
    }
}

impl Object for Message {
    fn type_name(&self) -> &'static str {
        "Message"
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

fn name(text: &str) -> Value {
    Value::Bytes(Bytes::copy_from_slice(text.as_bytes()))
}

fn text(value: &Value, what: &str) -> Result<String, Violation> {
    value.as_text().map(str::to_string).ok_or_else(|| Violation::new(format!("{what} must be a string")))
}

fn req_id(value: &Value) -> Result<u64, Violation> {
    value
        .as_int()
        .and_then(|v| u64::try_from(v).ok())
        .ok_or_else(|| Violation::new("request id must be a non-negative INT"))
}

fn check_name(token: TokenType, size: u64, what: &str) -> Result<(), Violation> {
    match token {
        TokenType::Vocab => Ok(()),
        TokenType::String if size <= MAX_NAME_LENGTH => Ok(()),
        TokenType::String => Err(Violation::new(format!("{what} of {size} bytes is too long"))),
        other => Err(Violation::new(format!("{what} must be a STRING, got {}", other.name()))),
    }
}

fn ref_id(value: &Value) -> Result<RefId, Violation> {
    match value {
        Value::Int(clid) => u64::try_from(*clid)
            .map(RefId::Clid)
            .map_err(|_| Violation::new("clid must be non-negative")),
        other => text(other, "refID").map(RefId::Name),
    }
}

fn check_ref_id(token: TokenType, size: u64) -> Result<(), Violation> {
    match token {
        TokenType::Int => Ok(()),
        other => check_name(other, size, "refID"),
    }
}

enum CallStage {
    ReqId,
    Target,
    Method,
    ArgName,
    ArgValue(String),
}

/// `call`
pub(crate) struct CallUnslicer {
    stage: CallStage,
    req_id: Option<u64>,
    target: Option<Arc<dyn Referenceable>>,
    interface: Option<Arc<InterfaceSchema>>,
    method: Option<String>,
    args: BTreeMap<String, Value>,
}

impl CallUnslicer {
    fn new() -> Self {
        Self {
            stage: CallStage::ReqId,
            req_id: None,
            target: None,
            interface: None,
            method: None,
            args: BTreeMap::new(),
        }
    }

    fn method_schema(&self) -> Option<&MethodSchema> {
        self.interface.as_ref()?.get(self.method.as_deref()?)
    }

    fn value_constraint(&self) -> Option<&Constraint> {
        match &self.stage {
            CallStage::ArgValue(arg) => self.method_schema()?.arg_constraint(arg),
            _ => None,
        }
    }
}

impl Unslicer<BrokerState> for CallUnslicer {
    fn check_token(&self, token: TokenType, size: u64) -> Result<(), Violation> {
        match self.stage {
            CallStage::ReqId if token == TokenType::Int => Ok(()),
            CallStage::ReqId => Err(Violation::new("call must start with a request id")),
            CallStage::Target => check_ref_id(token, size),
            CallStage::Method => check_name(token, size, "method name"),
            CallStage::ArgName => check_name(token, size, "argument name"),
            CallStage::ArgValue(_) => self.value_constraint().map_or(Ok(()), |c| c.check_token(token, size)),
        }
    }

    fn do_open(
        &mut self,
        index: &[Bytes],
        cx: &mut Context<'_, BrokerState>,
    ) -> Result<Option<Box<dyn Unslicer<BrokerState>>>, Violation> {
        let constraint = self.value_constraint().cloned();
        cx.open(index, constraint.as_ref())
    }

    fn receive_child(
        &mut self,
        child: Result<Value, UnbananaFailure>,
        cx: &mut Context<'_, BrokerState>,
    ) -> Result<(), Violation> {
        let value = child.map_err(|f| f.violation)?;
        match mem::replace(&mut self.stage, CallStage::ArgName) {
            CallStage::ReqId => {
                self.req_id = Some(req_id(&value)?);
                self.stage = CallStage::Target;
            },
            CallStage::Target => {
                let target = ref_id(&value)?;
                let object = cx
                    .host
                    .target(&target)
                    .ok_or_else(|| Violation::new(format!("unknown target {target}")))?;
                self.interface = object.interface();
                self.target = Some(object);
                self.stage = CallStage::Method;
            },
            CallStage::Method => {
                let method = text(&value, "method name")?;
                if let Some(interface) = &self.interface
                    && interface.get(&method).is_none()
                {
                    return Err(Violation::new(format!(
                        "interface {} has no method {method:?}",
                        interface.name()
                    )));
                }
                self.method = Some(method);
            },
            CallStage::ArgName => {
                let wire_name = text(&value, "argument name")?;
                let arg = match self.method_schema() {
                    Some(schema) => schema.resolve_name(&wire_name)?,
                    None => wire_name,
                };
                if self.args.contains_key(&arg) {
                    return Err(Violation::new(format!("argument {arg:?} given twice")));
                }
                self.stage = CallStage::ArgValue(arg);
            },
            CallStage::ArgValue(arg) => {
                self.args.insert(arg, value);
            },
        }
        Ok(())
    }

    fn receive_close(&mut self, cx: &mut Context<'_, BrokerState>) -> Result<Value, Violation> {
        let (Some(req_id), Some(target), Some(method), CallStage::ArgName) =
            (self.req_id, self.target.clone(), self.method.clone(), &self.stage)
        else {
            return Err(Violation::new("call closed before it was complete"));
        };
        let result = match self.method_schema() {
            Some(schema) => {
                schema.check_complete(&self.args)?;
                schema.result().cloned()
            },
            None => None,
        };
        cx.host.push_inbound(InboundCall {
            req_id,
            target,
            method,
            args: Arguments::new(mem::take(&mut self.args)),
            result,
        });
        Ok(Value::None)
    }

    fn abandoned(&mut self, violation: &Violation, cx: &mut Context<'_, BrokerState>) {
        if let Some(req_id) = self.req_id {
            cx.host.reject_inbound(req_id, Failure::from_violation(violation));
        }
    }
}

/// `answer`
#[derive(Default)]
pub(crate) struct AnswerUnslicer {
    req_id: Option<u64>,
    constraint: Option<Constraint>,
    value: Option<Value>,
}

impl Unslicer<BrokerState> for AnswerUnslicer {
    fn check_token(&self, token: TokenType, size: u64) -> Result<(), Violation> {
        match (self.req_id, &self.value) {
            (None, _) if token == TokenType::Int => Ok(()),
            (None, _) => Err(Violation::new("answer must start with a request id")),
            (Some(_), Some(_)) => Err(Violation::new("answer carries a single value")),
            (Some(_), None) => self.constraint.as_ref().map_or(Ok(()), |c| c.check_token(token, size)),
        }
    }

    fn do_open(
        &mut self,
        index: &[Bytes],
        cx: &mut Context<'_, BrokerState>,
    ) -> Result<Option<Box<dyn Unslicer<BrokerState>>>, Violation> {
        cx.open(index, self.constraint.as_ref())
    }

    fn receive_child(
        &mut self,
        child: Result<Value, UnbananaFailure>,
        cx: &mut Context<'_, BrokerState>,
    ) -> Result<(), Violation> {
        let value = child.map_err(|f| f.violation)?;
        if self.req_id.is_none() {
            let id = req_id(&value)?;
            self.constraint = cx.host.answer_constraint(id)?;
            self.req_id = Some(id);
        } else {
            self.value = Some(value);
        }
        Ok(())
    }

    fn receive_close(&mut self, cx: &mut Context<'_, BrokerState>) -> Result<Value, Violation> {
        let (Some(req_id), Some(value)) = (self.req_id, self.value.take()) else {
            return Err(Violation::new("answer closed before it was complete"));
        };
        cx.host.settle(req_id, Ok(value));
        Ok(Value::None)
    }

    fn abandoned(&mut self, violation: &Violation, cx: &mut Context<'_, BrokerState>) {
        if let Some(req_id) = self.req_id.take() {
            cx.host.settle(req_id, Err(CallError::Violation(violation.clone())));
        }
    }
}

/// `error`
#[derive(Default)]
pub(crate) struct ErrorUnslicer {
    req_id: Option<u64>,
    failure: Option<Failure>,
}

impl Unslicer<BrokerState> for ErrorUnslicer {
    fn check_token(&self, token: TokenType, size: u64) -> Result<(), Violation> {
        match (self.req_id, &self.failure, token) {
            (None, _, TokenType::Int) => Ok(()),
            (Some(_), None, TokenType::String) if size <= MAX_DESCRIPTION_LENGTH => Ok(()),
            (Some(_), None, TokenType::Vocab) => Ok(()),
            _ => Err(Violation::new(format!("unexpected {} in error", token.name()))),
        }
    }

    fn receive_child(
        &mut self,
        child: Result<Value, UnbananaFailure>,
        cx: &mut Context<'_, BrokerState>,
    ) -> Result<(), Violation> {
        let value = child.map_err(|f| f.violation)?;
        if self.req_id.is_none() {
            let id = req_id(&value)?;
            cx.host.answer_constraint(id)?;
            self.req_id = Some(id);
        } else {
            let description = value
                .as_bytes()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .ok_or_else(|| Violation::new("error description must be a string"))?;
            self.failure = Some(Failure::from_wire(&description));
        }
        Ok(())
    }

    fn receive_close(&mut self, cx: &mut Context<'_, BrokerState>) -> Result<Value, Violation> {
        let (Some(req_id), Some(failure)) = (self.req_id, self.failure.take()) else {
            return Err(Violation::new("error closed before it was complete"));
        };
        cx.host.settle(req_id, Err(CallError::Remote(failure)));
        Ok(Value::None)
    }

    fn abandoned(&mut self, violation: &Violation, cx: &mut Context<'_, BrokerState>) {
        if let Some(req_id) = self.req_id.take() {
            cx.host.settle(req_id, Err(CallError::Violation(violation.clone())));
        }
    }
}

/// `decref`
#[derive(Default)]
pub(crate) struct DecrefUnslicer {
    clid: Option<u64>,
}

impl Unslicer<BrokerState> for DecrefUnslicer {
    fn check_token(&self, token: TokenType, _size: u64) -> Result<(), Violation> {
        if self.clid.is_none() && token == TokenType::Int {
            Ok(())
        } else {
            Err(Violation::new("decref carries a single clid"))
        }
    }

    fn receive_child(
        &mut self,
        child: Result<Value, UnbananaFailure>,
        _cx: &mut Context<'_, BrokerState>,
    ) -> Result<(), Violation> {
        let value = child.map_err(|f| f.violation)?;
        match ref_id(&value)? {
            RefId::Clid(clid) => self.clid = Some(clid),
            RefId::Name(_) => return Err(Violation::new("published names are not reference counted")),
        }
        Ok(())
    }

    fn receive_close(&mut self, cx: &mut Context<'_, BrokerState>) -> Result<Value, Violation> {
        let clid = self.clid.ok_or_else(|| Violation::new("decref without a clid"))?;
        cx.host.decref(clid);
        Ok(Value::None)
    }
}

/// `my-reference`
#[derive(Default)]
pub(crate) struct MyReferenceUnslicer {
    clid: Option<u64>,
    interface: Option<String>,
}

impl Unslicer<BrokerState> for MyReferenceUnslicer {
    fn check_token(&self, token: TokenType, size: u64) -> Result<(), Violation> {
        match (self.clid, &self.interface) {
            (None, _) if token == TokenType::Int => Ok(()),
            (Some(_), None) => check_name(token, size, "interface name"),
            _ => Err(Violation::new(format!("unexpected {} in my-reference", token.name()))),
        }
    }

    fn receive_child(
        &mut self,
        child: Result<Value, UnbananaFailure>,
        _cx: &mut Context<'_, BrokerState>,
    ) -> Result<(), Violation> {
        let value = child.map_err(|f| f.violation)?;
        if self.clid.is_none() {
            match ref_id(&value)? {
                RefId::Clid(clid) => self.clid = Some(clid),
                RefId::Name(_) => return Err(Violation::new("my-reference needs an integer clid")),
            }
        } else {
            self.interface = Some(text(&value, "interface name")?);
        }
        Ok(())
    }

    fn receive_close(&mut self, cx: &mut Context<'_, BrokerState>) -> Result<Value, Violation> {
        let clid = self.clid.ok_or_else(|| Violation::new("my-reference without a clid"))?;
        Ok(cx.host.remote_reference(clid, self.interface.as_deref()).into())
    }

    fn abandoned(&mut self, _violation: &Violation, cx: &mut Context<'_, BrokerState>) {
        if let Some(clid) = self.clid.take() {
            cx.host.release_unread(clid);
        }
    }
}

/// `your-reference`
#[derive(Default)]
pub(crate) struct YourReferenceUnslicer {
    target: Option<RefId>,
}

impl Unslicer<BrokerState> for YourReferenceUnslicer {
    fn check_token(&self, token: TokenType, size: u64) -> Result<(), Violation> {
        if self.target.is_some() {
            return Err(Violation::new("your-reference carries a single refID"));
        }
        check_ref_id(token, size)
    }

    fn receive_child(
        &mut self,
        child: Result<Value, UnbananaFailure>,
        _cx: &mut Context<'_, BrokerState>,
    ) -> Result<(), Violation> {
        self.target = Some(ref_id(&child.map_err(|f| f.violation)?)?);
        Ok(())
    }

    fn receive_close(&mut self, cx: &mut Context<'_, BrokerState>) -> Result<Value, Violation> {
        let target = self.target.take().ok_or_else(|| Violation::new("your-reference without a refID"))?;
        let object = cx
            .host
            .target(&target)
            .ok_or_else(|| Violation::new(format!("your-reference names unknown object {target}")))?;
        Ok(export(object))
    }
}

/// Opentypes spoken by a broker connection.
pub(crate) fn registry() -> Registry<BrokerState> {
    let mut registry = Registry::empty();
    registry.register_builtins();
    registry.register(MY_REFERENCE, simple(|_| Box::new(MyReferenceUnslicer::default())));
    registry.register("your-reference", simple(|_| Box::new(YourReferenceUnslicer::default())));
    registry.register_top_level("call", simple(|_| Box::new(CallUnslicer::new())));
    registry.register_top_level("answer", simple(|_| Box::new(AnswerUnslicer::default())));
    registry.register_top_level("error", simple(|_| Box::new(ErrorUnslicer::default())));
    registry.register_top_level("decref", simple(|_| Box::new(DecrefUnslicer::default())));
    registry.register_vocab();
    registry
}

/// Top-level objects a broker accepts.
pub(crate) fn root_constraint() -> Constraint {
    Constraint::Opentypes(vec!["call", "answer", "error", "decref"])
}
