use proc_macro::TokenStream;
use quote::quote;
use syn::parse::Parser;
use syn::punctuated::Punctuated;
use syn::{Attribute, Expr, ExprLit, ItemFn, Lit, LitInt, MetaNameValue, Token, parse_macro_input};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

struct Options {
    secs: u64,
    /// Worker threads; `None` runs on a current-thread runtime.
    threads: Option<usize>,
}

/// Runs an async test on its own Tokio runtime and fails it instead of hanging.
///
/// Accepts `#[tokio_timeout_test]`, `#[tokio_timeout_test(30)]` or
/// `#[tokio_timeout_test(secs = 30, threads = 2)]`.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let options = match parse_options(attr) {
        Ok(options) => options,
        Err(err) => return err.to_compile_error().into(),
    };

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

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();

    let timeout = options.secs;
    let runtime = match options.threads {
        Some(threads) => quote! {
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(#threads)
                .enable_all()
                .build()
        },
        None => quote! {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
        },
    };

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#timeout);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let runtime = #runtime.expect("failed to build Tokio runtime");
                    runtime.block_on(async {
                        tokio::time::timeout(timeout_duration, async move #block)
                            .await
                            .expect("test timed out");
                    });
                }));
                let _ = sender.send(result);
            });
            // a little slack so the in-runtime timeout reports first
            let grace = timeout_duration + std::time::Duration::from_secs(1);
            match receiver.recv_timeout(grace) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

fn parse_options(attr: TokenStream) -> syn::Result<Options> {
    let mut options = Options {
        secs: DEFAULT_TIMEOUT_SECS,
        threads: None,
    };
    if attr.is_empty() {
        return Ok(options);
    }

    if let Ok(lit) = syn::parse::<LitInt>(attr.clone()) {
        options.secs = positive(&lit)?;
        return Ok(options);
    }

    let pairs = Punctuated::<MetaNameValue, Token![,]>::parse_terminated.parse(attr)?;
    for pair in pairs {
        let lit = match &pair.value {
            Expr::Lit(ExprLit {
                lit: Lit::Int(lit), ..
            }) => lit.clone(),
            other => return Err(syn::Error::new_spanned(other, "expected an integer")),
        };
        if pair.path.is_ident("secs") {
            options.secs = positive(&lit)?;
        } else if pair.path.is_ident("threads") {
            options.threads = Some(positive(&lit)? as usize);
        } else {
            return Err(syn::Error::new_spanned(
                &pair.path,
                "unknown option; expected `secs` or `threads`",
            ));
        }
    }
    Ok(options)
}

fn positive(lit: &LitInt) -> syn::Result<u64> {
    let value: u64 = lit.base10_parse()?;
    if value == 0 {
        return Err(syn::Error::new_spanned(lit, "value must be greater than zero"));
    }
    Ok(value)
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}
