use std::any::{type_name, Any};
use std::fmt::{self, Debug};
use std::sync::Arc;

use crate::Error;

/// The payload carried by a settlement: a resolve value, a rejection reason
/// or a progress notification.
///
/// Cloning is cheap, the payload itself is shared. A `Value` may be "null",
/// which is what a pending cell reports as its value.
///
/// # Examples
///
/// ```
/// use promise_out::Value;
/// let v = Value::new(21_i32);
/// assert_eq!(v.get::<i32>(), Some(&21));
/// assert!(v.get::<String>().is_none());
/// assert!(Value::null().is_null());
/// ```
#[derive(Clone, Default)]
pub struct Value {
    inner: Option<Arc<dyn Any + Send + Sync>>,
    type_name: &'static str,
}

impl Value {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            inner: Some(Arc::new(value)),
            type_name: type_name::<T>(),
        }
    }

    /// A value holding nothing.
    pub fn null() -> Self {
        Self::default()
    }

    /// Wraps an ordered list of values, as produced by the combinators.
    pub fn list(values: Vec<Value>) -> Self {
        Self::new(values)
    }

    pub fn is_null(&self) -> bool {
        self.inner.is_none()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.inner.as_ref().is_some_and(|v| v.is::<T>())
    }

    pub fn get<T: Any>(&self) -> Option<&T> {
        self.inner.as_ref().and_then(|v| v.downcast_ref::<T>())
    }

    /// Clones the payload out as a `T`.
    pub fn downcast<T: Any + Clone>(&self) -> Result<T, Error> {
        self.get::<T>().cloned().ok_or(Error::TypeMismatch {
            expected: type_name::<T>(),
            found: self.type_name(),
        })
    }

    /// The items of a list value, or `None` if this is not a list.
    pub fn as_list(&self) -> Option<&[Value]> {
        self.get::<Vec<Value>>().map(Vec::as_slice)
    }

    pub fn type_name(&self) -> &'static str {
        if self.is_null() {
            "null"
        } else {
            self.type_name
        }
    }

    /// Identity comparison: true if both values share the same payload.
    pub fn ptr_eq(&self, other: &Value) -> bool {
        match (&self.inner, &other.inner) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return f.write_str("Value(null)");
        }
        if let Some(list) = self.as_list() {
            return f.debug_tuple("Value").field(&list).finish();
        }
        if let Some(s) = self.get::<String>() {
            return f.debug_tuple("Value").field(s).finish();
        }
        if let Some(s) = self.get::<&'static str>() {
            return f.debug_tuple("Value").field(s).finish();
        }
        if let Some(e) = self.get::<Error>() {
            return f.debug_tuple("Value").field(e).finish();
        }
        write!(f, "Value(<{}>)", self.type_name)
    }
}

macro_rules! impl_from_for_value {
    ($($t:ty),* $(,)?) => {
        $(
            impl From<$t> for Value {
                fn from(value: $t) -> Self {
                    Value::new(value)
                }
            }
        )*
    };
}

impl_from_for_value!(
    bool,
    char,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    f32,
    f64,
    String,
    &'static str,
    Vec<Value>,
    Error,
);

/// `()` carries nothing.
impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::null()
    }
}
