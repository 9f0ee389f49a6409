use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{parse_macro_input, Expr, ExprLit, ImplItem, ItemImpl, Lit, LitStr, Type};

use crate::service_method::{take_callable, CallableMethod, CallableParam, ReplyShape};

/// Arguments for `#[rpc_service]`
#[derive(Default)]
struct ServiceArgs {
    name: Option<LitStr>,
    discover: bool,
}

/// Implementation of `#[rpc_service]`: strips the callable markers from the
/// impl block and implements `RpcService` for its self type
pub fn impl_rpc_service(args: TokenStream, input: TokenStream) -> TokenStream {
    let mut service_args = ServiceArgs::default();
    let parser = syn::meta::parser(|meta| {
        if meta.path.is_ident("name") {
            service_args.name = Some(meta.value()?.parse()?);
            Ok(())
        } else if meta.path.is_ident("discover") {
            service_args.discover = true;
            Ok(())
        } else {
            Err(meta.error("expected `name = \"...\"` or `discover`"))
        }
    });
    parse_macro_input!(args with parser);

    let mut item = parse_macro_input!(input as ItemImpl);
    match expand(&service_args, &mut item) {
        Ok(generated) => quote! {
            #item
            #generated
        }
        .into(),
        Err(err) => {
            let err = err.to_compile_error();
            quote! {
                #item
                #err
            }
            .into()
        }
    }
}

fn expand(args: &ServiceArgs, item: &mut ItemImpl) -> syn::Result<TokenStream2> {
    if !item.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            &item.generics,
            "#[rpc_service] does not support generic impl blocks",
        ));
    }
    if let Some((_, path, _)) = &item.trait_ {
        return Err(syn::Error::new_spanned(
            path,
            "#[rpc_service] goes on an inherent impl block, not a trait impl",
        ));
    }
    let self_ty = &item.self_ty;
    let type_name = match &**self_ty {
        Type::Path(path) => path
            .path
            .segments
            .last()
            .map(|segment| segment.ident.clone())
            .ok_or_else(|| syn::Error::new_spanned(self_ty, "expected a named type"))?,
        other => return Err(syn::Error::new_spanned(other, "#[rpc_service] expects a named type")),
    };

    let mut methods = Vec::new();
    let mut errors: Option<syn::Error> = None;
    for impl_item in &mut item.items {
        if let ImplItem::Fn(method) = impl_item {
            match take_callable(method) {
                Ok(Some(callable)) => methods.push(callable),
                Ok(None) => {}
                Err(err) => match &mut errors {
                    Some(existing) => existing.combine(err),
                    None => errors = Some(err),
                },
            }
        }
    }
    if let Some(errors) = errors {
        return Err(errors);
    }

    let registrations = methods.iter().map(registration);
    let alias = args.name.as_ref().map(|name| {
        quote! {
            fn service_alias() -> ::core::option::Option<&'static str> {
                ::core::option::Option::Some(#name)
            }
        }
    });

    let discovery = args.discover.then(|| {
        let install = format_ident!("__aid_rpc_install_{}", type_name.to_string().to_lowercase());
        let type_label = LitStr::new(&type_name.to_string(), type_name.span());
        quote! {
            #[doc(hidden)]
            #[allow(non_snake_case)]
            fn #install(builder: ::aid_rpc::RegistryBuilder) -> ::aid_rpc::RegistryBuilder {
                builder.default_service::<#self_ty>()
            }

            ::aid_rpc::__private::inventory::submit! {
                ::aid_rpc::registry::ServiceDescriptor {
                    module_path: ::core::module_path!(),
                    type_name: #type_label,
                    install: #install,
                }
            }
        }
    });

    Ok(quote! {
        impl ::aid_rpc::RpcService for #self_ty {
            #alias

            fn register_methods(methods: &mut ::aid_rpc::MethodTable<Self>) {
                #(#registrations)*
            }
        }

        #discovery
    })
}

/// `methods.callable(..).param..().sync(..)` for one method
fn registration(method: &CallableMethod) -> TokenStream2 {
    let ident = &method.ident;
    let rust_name = LitStr::new(&ident.to_string(), ident.span());
    let alias = method.alias.as_ref().map(|alias| quote!(.alias(#alias)));
    let params = method.params.iter().map(declare_param);

    let idents: Vec<_> = method.params.iter().map(|param| &param.ident).collect();
    let types: Vec<_> = method.params.iter().map(|param| &param.ty).collect();
    let pattern = quote!((#(#idents,)*): (#(#types,)*));

    if method.is_async {
        let call = wrap_reply(&method.reply, quote!(Self::#ident(&this, #(#idents),*).await));
        quote! {
            methods
                .callable(#rust_name)
                #alias
                #(#params)*
                .future(|this: ::std::sync::Arc<Self>, #pattern| async move { #call });
        }
    } else {
        let call = wrap_reply(&method.reply, quote!(Self::#ident(this, #(#idents),*)));
        quote! {
            methods
                .callable(#rust_name)
                #alias
                #(#params)*
                .sync(|this: &Self, #pattern| #call);
        }
    }
}

fn declare_param(param: &CallableParam) -> TokenStream2 {
    let name = LitStr::new(&param.name, param.ident.span());
    let ty = &param.ty;
    match &param.default {
        None => quote!(.param::<#ty>(#name)),
        // String literals convert into the parameter type (`&str` -> `String`)
        Some(Expr::Lit(ExprLit { lit: Lit::Str(text), .. })) => {
            quote!(.param_or::<#ty>(#name, ::core::convert::Into::<#ty>::into(#text)))
        }
        Some(default) => quote!(.param_or::<#ty>(#name, #default)),
    }
}

fn wrap_reply(shape: &ReplyShape, call: TokenStream2) -> TokenStream2 {
    match shape {
        ReplyShape::Unit | ReplyShape::Fallible => call,
        ReplyShape::Value => quote!(::aid_rpc::Reply(#call)),
    }
}
