//! Attribute macros that wrap test functions in a hard wall-clock timeout so a
//! wedged async loop fails the suite instead of hanging it.

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// `#[test_timeout::tokio_timeout_test]` — runs an async test on a dedicated
/// current-thread Tokio runtime, aborting after the given number of seconds
/// (default 30). Usage: `#[test_timeout::tokio_timeout_test(120)]`.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let timeout_secs = parse_timeout_secs(attr);

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let kept_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_attr(attr, &["tokio", "test"]))
        .collect();

    let body = quote! {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build Tokio runtime");
        runtime.block_on(async {
            tokio::time::timeout(timeout_duration, async move #block)
                .await
                .expect("test timed out");
        });
    };

    expand(timeout_secs, kept_attrs, vis, sig, body)
}

/// `#[test_timeout::timeout]` — same guard for synchronous tests.
#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let timeout_secs = parse_timeout_secs(attr);

    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout attribute expects a synchronous test function",
        )
        .to_compile_error()
        .into();
    }

    let kept_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_attr(attr, &["test"]))
        .collect();

    expand(timeout_secs, kept_attrs, vis, sig, quote!(#block))
}

fn parse_timeout_secs(attr: TokenStream) -> u64 {
    if attr.is_empty() {
        return DEFAULT_TIMEOUT_SECS;
    }
    let lit: LitInt = syn::parse(attr).expect("timeout takes a single integer literal");
    let secs: u64 = lit
        .base10_parse()
        .unwrap_or_else(|err| panic!("invalid timeout value: {err}"));
    if secs == 0 {
        panic!("timeout must be greater than zero");
    }
    secs
}

fn expand(
    timeout_secs: u64,
    attrs: Vec<Attribute>,
    vis: syn::Visibility,
    sig: syn::Signature,
    body: proc_macro2::TokenStream,
) -> TokenStream {
    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#timeout_secs);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    #body
                }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(timeout_duration) {
                Ok(Ok(())) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

fn is_attr(attr: &Attribute, path: &[&str]) -> bool {
    let segments: Vec<_> = attr.path().segments.iter().collect();
    segments.len() == path.len()
        && segments
            .iter()
            .zip(path)
            .all(|(segment, expected)| segment.ident == expected)
}
