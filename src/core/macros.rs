//! Macros for ergonomic state declaration.

/// Generate a state struct, its patch struct and the `State` implementation.
///
/// Every field of the patch is an `Option` of the state field's type; `None`
/// leaves the field untouched on merge. Shallow equality compares each field
/// with `==`.
///
/// # Example
///
/// ```
/// use transit::core::State;
/// use transit::state_struct;
///
/// state_struct! {
///     pub struct Profile {
///         pub name: String,
///         pub visits: u32,
///     }
///     patch: ProfilePatch
/// }
///
/// let mut profile = Profile::default();
/// profile.merge(ProfilePatch {
///     visits: Some(3),
///     ..Default::default()
/// });
/// assert_eq!(profile.visits, 3);
/// assert!(profile.shallow_eq(&profile.clone()));
/// ```
#[macro_export]
macro_rules! state_struct {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[$field_meta:meta])*
                $field_vis:vis $field:ident : $ty:ty
            ),* $(,)?
        }
        patch: $patch:ident
    ) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Default)]
        $vis struct $name {
            $(
                $(#[$field_meta])*
                $field_vis $field: $ty
            ),*
        }

        #[derive(Clone, Debug, PartialEq, Default)]
        $vis struct $patch {
            $(
                $field_vis $field: ::std::option::Option<$ty>
            ),*
        }

        impl $crate::core::State for $name {
            type Patch = $patch;

            fn merge(&mut self, patch: Self::Patch) {
                $(
                    if let ::std::option::Option::Some(value) = patch.$field {
                        self.$field = value;
                    }
                )*
            }

            fn shallow_eq(&self, other: &Self) -> bool {
                true $(&& self.$field == other.$field)*
            }
        }
    };
}
