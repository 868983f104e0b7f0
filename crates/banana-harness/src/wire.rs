//! Decoding captured broker traffic.
//!
//! The broker's own unslicers act on what they decode; these record it
//! instead, so a test can assert on the exact messages one side wrote.

use std::sync::Arc;

use banana_core::{
    Banana, BananaConfig, BananaError, BananaEvent, Context, Factory, Registry, UnbananaFailure,
    Unslicer, Value, Violation, registry::simple,
};

/// One top-level broker message as it appeared on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    /// `call`, `answer`, `error` or `decref`
    pub opentype: String,
    /// Body values in wire order. Nested references decode to a tuple of
    /// their opentype name followed by their body.
    pub body: Vec<Value>,
}

impl WireMessage {
    /// First body value as an integer: the reqID, or the clid of a decref.
    pub fn id(&self) -> Option<i128> {
        self.body.first().and_then(Value::as_int)
    }

    /// Whether this is a message of `opentype`.
    pub fn is(&self, opentype: &str) -> bool {
        self.opentype == opentype
    }

    /// Body value at `index` as text.
    pub fn text(&self, index: usize) -> Option<&str> {
        self.body.get(index).and_then(Value::as_text)
    }
}

struct Recorder {
    opentype: &'static str,
    items: Vec<Value>,
}

impl Unslicer<()> for Recorder {
    fn receive_child(
        &mut self,
        child: Result<Value, UnbananaFailure>,
        _cx: &mut Context<'_, ()>,
    ) -> Result<(), Violation> {
        self.items.push(child.map_err(|f| f.violation)?);
        Ok(())
    }

    fn receive_close(&mut self, _cx: &mut Context<'_, ()>) -> Result<Value, Violation> {
        let mut items = vec![Value::Text(self.opentype.to_string())];
        items.append(&mut self.items);
        Ok(Value::tuple(items))
    }
}

fn recorder(opentype: &'static str) -> Factory<()> {
    simple(move |_| Box::new(Recorder { opentype, items: Vec::new() }))
}

fn registry() -> Registry<()> {
    let mut registry = Registry::empty();
    registry.register_builtins();
    for name in ["my-reference", "your-reference"] {
        registry.register(name, recorder(name));
    }
    for name in ["call", "answer", "error", "decref"] {
        registry.register_top_level(name, recorder(name));
    }
    registry.register_vocab();
    registry
}

/// Decode every complete broker message in `bytes`.
///
/// `bytes` must be everything one side wrote, from the start of the
/// connection, so vocabulary and reference scopes line up.
pub fn decode_messages(bytes: &[u8]) -> Result<Vec<WireMessage>, BananaError> {
    let mut banana = Banana::new(BananaConfig::default(), Arc::new(registry()), ());
    let events = banana.data_received(bytes)?;
    let messages = events
        .into_iter()
        .filter_map(|event| match event {
            BananaEvent::Received(Value::Tuple(tuple)) => {
                let (head, body) = tuple.items().split_first()?;
                Some(WireMessage { opentype: head.as_text()?.to_string(), body: body.to_vec() })
            },
            _ => None,
        })
        .collect();
    Ok(messages)
}
