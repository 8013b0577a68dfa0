//! Runtime element-type descriptors
//!
//! `TypeMeta` erases the element type of a tensor into a small copyable
//! token (type id, item size, optional construction hooks) so storage code
//! never carries compile-time generics. Typed access re-checks the token
//! before handing out pointers.

use std::any::TypeId;
use std::fmt;

/// Marker trait for element types a tensor may hold.
///
/// Restricted to plain-old-data types: in-place reinterpretation of a
/// buffer (when capacity already fits) never fabricates values carrying
/// invariants.
pub trait TensorType: Copy + Default + Send + Sync + 'static {}

macro_rules! impl_tensor_type {
    ($($t:ty),* $(,)?) => {
        $(impl TensorType for $t {})*
    };
}

impl_tensor_type!(bool, u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

fn default_fill<T: TensorType>(data: *mut u8, count: usize) {
    let ptr = data as *mut T;
    for i in 0..count {
        // SAFETY: caller hands a host-addressable buffer with room for
        // `count` elements of T
        unsafe { ptr.add(i).write(T::default()) };
    }
}

/// Runtime descriptor of a tensor element type.
///
/// Two descriptors are equal iff their type ids match. The unbound
/// descriptor ([`TypeMeta::uninitialized`]) signals "no type yet"; all
/// typed access against it fails.
#[derive(Clone, Copy)]
pub struct TypeMeta {
    id: Option<TypeId>,
    item_size: usize,
    name: &'static str,
    ctor: Option<fn(*mut u8, usize)>,
    dtor: Option<fn(*mut u8, usize)>,
}

impl TypeMeta {
    /// The "no type yet" descriptor
    pub fn uninitialized() -> Self {
        TypeMeta {
            id: None,
            item_size: 0,
            name: "untyped",
            ctor: None,
            dtor: None,
        }
    }

    /// Build the descriptor for a concrete element type
    pub fn make<T: TensorType>() -> Self {
        TypeMeta {
            id: Some(TypeId::of::<T>()),
            item_size: std::mem::size_of::<T>(),
            name: std::any::type_name::<T>(),
            ctor: None,
            dtor: None,
        }
    }

    /// Like [`TypeMeta::make`], with a constructor hook that default-fills
    /// freshly allocated elements, plus an optional destructor hook run
    /// when the owning tensor drops its buffer.
    pub fn make_with_hooks<T: TensorType>(dtor: Option<fn(*mut u8, usize)>) -> Self {
        TypeMeta {
            ctor: Some(default_fill::<T>),
            dtor,
            ..Self::make::<T>()
        }
    }

    /// Return whether no concrete type is bound yet
    pub fn is_uninitialized(&self) -> bool {
        self.id.is_none()
    }

    /// Return whether this descriptor denotes `T`
    pub fn is<T: TensorType>(&self) -> bool {
        self.id == Some(TypeId::of::<T>())
    }

    /// Size of one element in bytes (zero when unbound)
    pub fn item_size(&self) -> usize {
        self.item_size
    }

    /// Human-readable type name for diagnostics
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Constructor hook, if any
    pub fn ctor(&self) -> Option<fn(*mut u8, usize)> {
        self.ctor
    }

    /// Destructor hook, if any
    pub fn dtor(&self) -> Option<fn(*mut u8, usize)> {
        self.dtor
    }
}

impl PartialEq for TypeMeta {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeMeta {}

impl fmt::Debug for TypeMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeMeta")
            .field("name", &self.name)
            .field("item_size", &self.item_size)
            .finish()
    }
}

impl fmt::Display for TypeMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_on_id_only() {
        assert_eq!(TypeMeta::make::<f32>(), TypeMeta::make::<f32>());
        assert_ne!(TypeMeta::make::<f32>(), TypeMeta::make::<f64>());
        // Hooks do not participate in equality
        assert_eq!(
            TypeMeta::make::<i32>(),
            TypeMeta::make_with_hooks::<i32>(None)
        );
    }

    #[test]
    fn test_uninitialized_matches_nothing() {
        let meta = TypeMeta::uninitialized();
        assert!(meta.is_uninitialized());
        assert_eq!(meta.item_size(), 0);
        assert!(!meta.is::<f32>());
        assert_ne!(meta, TypeMeta::make::<u8>());
    }

    #[test]
    fn test_item_size_positive_once_bound() {
        assert_eq!(TypeMeta::make::<f32>().item_size(), 4);
        assert_eq!(TypeMeta::make::<f64>().item_size(), 8);
        assert_eq!(TypeMeta::make::<bool>().item_size(), 1);
    }

    #[test]
    fn test_default_fill_ctor() {
        let meta = TypeMeta::make_with_hooks::<i32>(None);
        let mut buf = vec![0xFFu8; 4 * 4];
        let ctor = meta.ctor().expect("ctor hook set");
        ctor(buf.as_mut_ptr(), 4);
        assert_eq!(buf, vec![0u8; 16], "fresh elements should be default-filled");
    }
}
