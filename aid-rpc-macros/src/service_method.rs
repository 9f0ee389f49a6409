use proc_macro::TokenStream;
use proc_macro2::Span;
use syn::parse::{Parse, ParseStream};
use syn::{Attribute, Expr, FnArg, Ident, ImplItemFn, LitStr, Meta, Pat, ReturnType, Token, Type};

/// Arguments for `#[rpc_callable]`: nothing, `"alias"` or `alias = "alias"`
#[derive(Default)]
pub struct CallableArgs {
    pub alias: Option<LitStr>,
}

impl Parse for CallableArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        if input.is_empty() {
            return Ok(Self::default());
        }
        if input.peek(LitStr) {
            return Ok(Self {
                alias: Some(input.parse()?),
            });
        }
        let key: Ident = input.parse()?;
        if key != "alias" {
            return Err(syn::Error::new(key.span(), "expected `alias = \"...\"`"));
        }
        input.parse::<Token![=]>()?;
        Ok(Self {
            alias: Some(input.parse()?),
        })
    }
}

/// How a method's return value becomes a reply
pub enum ReplyShape {
    /// No return type or `()`
    Unit,
    /// `Result<T, E>`; errors become error responses
    Fallible,
    /// Anything else, wrapped in `Reply`
    Value,
}

pub struct CallableParam {
    pub ident: Ident,
    pub name: String,
    pub ty: Type,
    pub default: Option<Expr>,
}

/// A `#[rpc_callable]` method as seen by `#[rpc_service]`
pub struct CallableMethod {
    pub ident: Ident,
    pub alias: Option<LitStr>,
    pub params: Vec<CallableParam>,
    pub is_async: bool,
    pub reply: ReplyShape,
}

fn is_attr(attr: &Attribute, name: &str) -> bool {
    attr.path()
        .segments
        .last()
        .is_some_and(|segment| segment.ident == name)
}

/// Read (and strip) the callable markers of one method. `Ok(None)` for
/// methods that are not callable.
pub fn take_callable(method: &mut ImplItemFn) -> syn::Result<Option<CallableMethod>> {
    let Some(position) = method.attrs.iter().position(|attr| is_attr(attr, "rpc_callable")) else {
        return Ok(None);
    };
    let marker = method.attrs.remove(position);
    let args = match &marker.meta {
        Meta::Path(_) => CallableArgs::default(),
        Meta::List(_) => marker.parse_args::<CallableArgs>()?,
        Meta::NameValue(value) => {
            return Err(syn::Error::new_spanned(
                value,
                "use #[rpc_callable(alias = \"...\")] or #[rpc_callable(\"...\")]",
            ))
        }
    };

    let sig = &mut method.sig;
    if !sig.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            &sig.generics,
            "#[rpc_callable] methods cannot be generic",
        ));
    }

    let mut inputs = sig.inputs.iter_mut();
    match inputs.next() {
        Some(FnArg::Receiver(receiver)) if receiver.reference.is_some() && receiver.mutability.is_none() => {}
        _ => {
            return Err(syn::Error::new_spanned(
                &sig.ident,
                "#[rpc_callable] methods must take `&self`",
            ))
        }
    }

    let mut params = Vec::new();
    for (index, input) in inputs.enumerate() {
        let FnArg::Typed(typed) = input else {
            continue;
        };
        let mut default = None;
        let mut kept = Vec::with_capacity(typed.attrs.len());
        for attr in typed.attrs.drain(..) {
            if is_attr(&attr, "rpc_default") {
                default = Some(attr.parse_args::<Expr>()?);
            } else {
                kept.push(attr);
            }
        }
        typed.attrs = kept;

        let Pat::Ident(pattern) = &*typed.pat else {
            return Err(syn::Error::new_spanned(
                &typed.pat,
                "#[rpc_callable] parameters must be plain identifiers; the name is the wire name",
            ));
        };
        let name = pattern.ident.to_string();
        params.push(CallableParam {
            ident: Ident::new(&format!("__arg{index}"), Span::call_site()),
            name: name.strip_prefix("r#").unwrap_or(&name).to_string(),
            ty: (*typed.ty).clone(),
            default,
        });
    }

    Ok(Some(CallableMethod {
        ident: sig.ident.clone(),
        alias: args.alias,
        params,
        is_async: sig.asyncness.is_some(),
        reply: reply_shape(&sig.output),
    }))
}

fn reply_shape(output: &ReturnType) -> ReplyShape {
    match output {
        ReturnType::Default => ReplyShape::Unit,
        ReturnType::Type(_, ty) => match &**ty {
            Type::Tuple(tuple) if tuple.elems.is_empty() => ReplyShape::Unit,
            Type::Path(path)
                if path
                    .path
                    .segments
                    .last()
                    .is_some_and(|segment| segment.ident == "Result") =>
            {
                ReplyShape::Fallible
            }
            _ => ReplyShape::Value,
        },
    }
}

/// `#[rpc_callable]` outside an `#[rpc_service]` impl leaves the item untouched
pub fn impl_rpc_callable(args: TokenStream, input: TokenStream) -> TokenStream {
    if let Err(err) = syn::parse::<CallableArgs>(args) {
        let mut output: TokenStream = err.to_compile_error().into();
        output.extend(input);
        return output;
    }
    input
}
