
use proc_macro::TokenStream;

/// Runs an async integration test against a fresh `Network` for each sampled RNG seed.
///
/// The test function takes the `Network` by value. Seeds come from `UCCB_TEST_RNG_SEED` (a single seed) or
/// `UCCB_TEST_SAMPLES` (seeds `0..n`, default 1).
#[proc_macro_attribute]
pub fn test(args: TokenStream, item: TokenStream) -> TokenStream {
    test::test_macro(args.into(), item.into()).into()
}
