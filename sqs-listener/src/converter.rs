//! Turning raw payload bytes into the values handlers work with.

use std::marker::PhantomData;

use serde::{de::DeserializeOwned, Serialize};

use crate::{ListenerError, Message, Result};

pub trait MessageConverter<T>: Send + Sync + 'static {
    fn convert(&self, message: &Message) -> Result<T>;

    /// Encodes `value` into the payload [`MessageConverter::convert`] accepts.
    fn to_payload(&self, value: &T) -> Result<Vec<u8>> {
        let _ = value;
        Err(ListenerError::configuration(
            "this converter cannot encode payloads",
        ))
    }
}

impl<T, F> MessageConverter<T> for F
where
    F: Fn(&Message) -> Result<T> + Send + Sync + 'static,
{
    fn convert(&self, message: &Message) -> Result<T> {
        self(message)
    }
}

/// Payload types that come with a converter of their own.
pub trait FromMessage: Sized + Send + 'static {
    type Converter: MessageConverter<Self> + Default;
}

impl FromMessage for String {
    type Converter = Utf8;
}

impl FromMessage for Vec<u8> {
    type Converter = Bytes;
}

impl FromMessage for serde_json::Value {
    type Converter = Json<serde_json::Value>;
}

/// The payload as UTF-8 text.
#[derive(Clone, Copy, Debug, Default)]
pub struct Utf8;

impl MessageConverter<String> for Utf8 {
    fn convert(&self, message: &Message) -> Result<String> {
        String::from_utf8(message.borrow_payload().to_vec()).map_err(ListenerError::conversion)
    }

    fn to_payload(&self, value: &String) -> Result<Vec<u8>> {
        Ok(value.as_bytes().to_vec())
    }
}

/// The payload bytes as they are.
#[derive(Clone, Copy, Debug, Default)]
pub struct Bytes;

impl MessageConverter<Vec<u8>> for Bytes {
    fn convert(&self, message: &Message) -> Result<Vec<u8>> {
        Ok(message.borrow_payload().to_vec())
    }

    fn to_payload(&self, value: &Vec<u8>) -> Result<Vec<u8>> {
        Ok(value.clone())
    }
}

/// The payload decoded as JSON.
pub struct Json<T>(PhantomData<fn() -> T>);

impl<T> Json<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for Json<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MessageConverter<T> for Json<T>
where
    T: DeserializeOwned + Serialize + 'static,
{
    fn convert(&self, message: &Message) -> Result<T> {
        serde_json::from_slice(message.borrow_payload()).map_err(ListenerError::conversion)
    }

    fn to_payload(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }
}

pub trait MessageConverterExt<T>: MessageConverter<T> + Sized {
    /// Converts with `self`, then with `f`.
    fn and_then<U, F>(self, f: F) -> AndThen<Self, F, T>
    where
        F: Fn(T) -> Result<U> + Send + Sync + 'static,
    {
        AndThen {
            inner: self,
            f,
            _pd: PhantomData,
        }
    }
}

impl<T, C: MessageConverter<T>> MessageConverterExt<T> for C {}

pub struct AndThen<C, F, T> {
    inner: C,
    f: F,
    _pd: PhantomData<fn() -> T>,
}

impl<C, F, T, U> MessageConverter<U> for AndThen<C, F, T>
where
    C: MessageConverter<T>,
    F: Fn(T) -> Result<U> + Send + Sync + 'static,
    T: 'static,
{
    fn convert(&self, message: &Message) -> Result<U> {
        (self.f)(self.inner.convert(message)?)
    }
}
