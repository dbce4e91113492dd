/// Assert that a `Result<_, CacheError>` matches a specific error variant.
///
/// # Examples
///
/// ```rust
/// use cachebay::assert_error;
/// use cachebay::error::CacheError;
///
/// let result: Result<(), CacheError> = Err(CacheError::CacheMiss);
/// assert_error!(result, CacheError::CacheMiss);
/// ```
///
/// With field validation:
///
/// ```rust
/// use cachebay::assert_error;
/// use cachebay::error::CacheError;
///
/// let result: Result<(), CacheError> = Err(CacheError::InvalidCachePolicy("bogus".to_string()));
/// assert_error!(result, CacheError::InvalidCachePolicy(policy) => {
///     assert_eq!(policy, "bogus");
/// });
/// ```
#[macro_export]
macro_rules! assert_error {
    ($result:expr, $pattern:pat => $validation:block) => {
        if let Err(error) = &$result {
            match error {
                $pattern => $validation,
                other => panic!(
                    "Error variant mismatch. Expected pattern {}, got {:?}",
                    stringify!($pattern),
                    other
                ),
            }
        } else {
            panic!("Expected error result, got Ok");
        }
    };

    ($result:expr, $pattern:pat) => {
        if let Err(error) = &$result {
            assert!(
                matches!(error, $pattern),
                "Error variant mismatch. Expected pattern {}, got {:?}",
                stringify!($pattern),
                error
            );
        } else {
            panic!("Expected error result, got Ok");
        }
    };
}
