//! Derive macro for vitrine's `SharedMemorySafe` trait.
//!
//! Frame segments live in POSIX shared memory mapped by two separately
//! compiled processes, so the macro refuses anything whose layout or
//! contents could differ between them: it requires a stable `repr`,
//! rejects pointer-carrying and process-local types, and emits where
//! clauses so every field must itself be `SharedMemorySafe`.

use proc_macro::TokenStream;
use proc_macro_crate::{crate_name, FoundCrate};
use quote::quote;
use syn::{
    parse_macro_input, spanned::Spanned, Attribute, Data, DeriveInput, Error, Fields,
    GenericArgument, Ident, PathArguments, ReturnType, Type, TypePath,
};

/// Derives `SharedMemorySafe` after checking the type is fit for
/// cross-process shared memory.
///
/// Checks performed at expansion time:
/// - a stable representation is present: `#[repr(C)]`, `#[repr(transparent)]`,
///   or an integer repr on enums;
/// - no field mentions a heap, reference-counted, borrowed, raw-pointer, or
///   process-local-sync type anywhere in its type expression;
/// - every field type is bound `SharedMemorySafe` in the generated impl.
///
/// The impl is still `unsafe` at the trait level: the macro cannot prove
/// concurrent-access correctness, only layout and pointer-freedom.
#[proc_macro_derive(SharedMemorySafe)]
pub fn derive_shared_memory_safe(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand(input).unwrap_or_else(|err| err.to_compile_error().into())
}

fn expand(input: DeriveInput) -> syn::Result<TokenStream> {
    require_stable_repr(&input)?;

    let field_types = field_types(&input.data)?;
    for ty in &field_types {
        reject_unshareable(ty)?;
    }

    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    let krate = crate_path();

    let mut predicates = where_clause
        .map(|w| w.predicates.iter().cloned().collect::<Vec<_>>())
        .unwrap_or_default();
    for ty in &field_types {
        predicates.push(syn::parse_quote! {
            #ty: #krate::__SharedMemorySafePrivate
        });
    }

    let expanded = if predicates.is_empty() {
        quote! {
            unsafe impl #impl_generics #krate::__SharedMemorySafePrivate for #name #ty_generics {}
        }
    } else {
        quote! {
            unsafe impl #impl_generics #krate::__SharedMemorySafePrivate for #name #ty_generics
            where
                #(#predicates),*
            {}
        }
    };

    Ok(expanded.into())
}

/// Resolves the path to the vitrine crate, handling the crate deriving on
/// its own types.
fn crate_path() -> proc_macro2::TokenStream {
    match crate_name("vitrine") {
        Ok(FoundCrate::Name(name)) => {
            let ident = syn::Ident::new(&name, proc_macro2::Span::call_site());
            quote!(::#ident)
        }
        _ => quote!(::vitrine),
    }
}

fn repr_is_stable(ident: &Ident) -> bool {
    const INT_REPRS: &[&str] = &[
        "u8", "u16", "u32", "u64", "u128", "usize", "i8", "i16", "i32", "i64", "i128", "isize",
    ];
    ident == "C" || ident == "transparent" || INT_REPRS.iter().any(|r| ident == r)
}

fn attr_has_stable_repr(attr: &Attribute) -> syn::Result<bool> {
    if !attr.path().is_ident("repr") {
        return Ok(false);
    }
    let mut found = false;
    attr.parse_nested_meta(|meta| {
        if let Some(ident) = meta.path.get_ident() {
            if repr_is_stable(ident) {
                found = true;
            }
        }
        Ok(())
    })?;
    Ok(found)
}

fn require_stable_repr(input: &DeriveInput) -> syn::Result<()> {
    for attr in &input.attrs {
        if attr_has_stable_repr(attr)? {
            return Ok(());
        }
    }
    let msg = if matches!(input.data, Data::Enum(_)) {
        "SharedMemorySafe requires #[repr(C)] or an integer repr such as #[repr(u8)]"
    } else {
        "SharedMemorySafe requires #[repr(C)] or #[repr(transparent)]"
    };
    Err(Error::new(input.span(), msg))
}

fn field_types(data: &Data) -> syn::Result<Vec<Type>> {
    fn of_fields(fields: &Fields) -> Vec<Type> {
        match fields {
            Fields::Named(f) => f.named.iter().map(|f| f.ty.clone()).collect(),
            Fields::Unnamed(f) => f.unnamed.iter().map(|f| f.ty.clone()).collect(),
            Fields::Unit => Vec::new(),
        }
    }

    match data {
        Data::Struct(s) => Ok(of_fields(&s.fields)),
        Data::Enum(e) => Ok(e.variants.iter().flat_map(|v| of_fields(&v.fields)).collect()),
        Data::Union(u) => Err(Error::new(
            u.union_token.span,
            "SharedMemorySafe cannot be derived for unions",
        )),
    }
}

/// Walks a field's full type expression and rejects anything that cannot
/// cross a process boundary.
fn reject_unshareable(field_ty: &Type) -> syn::Result<()> {
    fn walk(ty: &Type, field_ty: &Type) -> syn::Result<()> {
        match ty {
            Type::Path(TypePath { path, .. }) => {
                for segment in &path.segments {
                    reject_forbidden_ident(&segment.ident, field_ty)?;
                    match &segment.arguments {
                        PathArguments::AngleBracketed(args) => {
                            for arg in &args.args {
                                if let GenericArgument::Type(inner) = arg {
                                    walk(inner, field_ty)?;
                                }
                            }
                        }
                        PathArguments::Parenthesized(args) => {
                            for input in &args.inputs {
                                walk(input, field_ty)?;
                            }
                            if let ReturnType::Type(_, ret) = &args.output {
                                walk(ret, field_ty)?;
                            }
                        }
                        PathArguments::None => {}
                    }
                }
                Ok(())
            }
            Type::Reference(r) => Err(Error::new(
                r.span(),
                format!(
                    "field type `{}` contains a reference; addresses are process-specific",
                    quote!(#field_ty)
                ),
            )),
            Type::Ptr(p) => Err(Error::new(
                p.span(),
                format!(
                    "field type `{}` contains a raw pointer; addresses are process-specific",
                    quote!(#field_ty)
                ),
            )),
            Type::Tuple(t) => t.elems.iter().try_for_each(|e| walk(e, field_ty)),
            Type::Array(a) => walk(&a.elem, field_ty),
            Type::Slice(s) => walk(&s.elem, field_ty),
            Type::Group(g) => walk(&g.elem, field_ty),
            Type::Paren(p) => walk(&p.elem, field_ty),
            _ => Ok(()),
        }
    }

    walk(field_ty, field_ty)
}

fn reject_forbidden_ident(ident: &Ident, field_ty: &Type) -> syn::Result<()> {
    const HEAP: &[&str] = &["Vec", "Box", "String", "PathBuf", "OsString", "CString"];
    const REFCOUNTED: &[&str] = &["Rc", "Arc"];
    const PROCESS_LOCAL: &[&str] = &["Mutex", "RwLock", "Condvar", "Barrier"];

    let complaint = if HEAP.iter().any(|n| ident == n) {
        Some("heap-allocating")
    } else if REFCOUNTED.iter().any(|n| ident == n) {
        Some("reference-counted")
    } else if PROCESS_LOCAL.iter().any(|n| ident == n) {
        Some("process-local")
    } else {
        None
    };

    if let Some(kind) = complaint {
        return Err(Error::new(
            ident.span(),
            format!(
                "field type `{}` contains `{}`, a {} type that cannot live in shared memory; \
                 use inline arrays and atomics instead",
                quote!(#field_ty),
                ident,
                kind,
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use syn::parse_quote;

    #[test]
    fn repr_c_struct_accepted() {
        let input: DeriveInput = parse_quote! {
            #[repr(C)]
            struct Header { counter: u64 }
        };
        assert!(require_stable_repr(&input).is_ok());
    }

    #[test]
    fn repr_transparent_accepted() {
        let input: DeriveInput = parse_quote! {
            #[repr(transparent)]
            struct Cell(u64);
        };
        assert!(require_stable_repr(&input).is_ok());
    }

    #[test]
    fn integer_repr_enum_accepted() {
        let input: DeriveInput = parse_quote! {
            #[repr(u32)]
            enum Format { Bgra }
        };
        assert!(require_stable_repr(&input).is_ok());
    }

    #[test]
    fn missing_repr_rejected() {
        let input: DeriveInput = parse_quote! {
            struct Header { counter: u64 }
        };
        assert!(require_stable_repr(&input).is_err());
    }

    #[test]
    fn primitives_and_atomics_accepted() {
        let types: [Type; 4] = [
            parse_quote!(u64),
            parse_quote!(AtomicU64),
            parse_quote!([u8; 4096]),
            parse_quote!(Option<u32>),
        ];
        for ty in types {
            assert!(reject_unshareable(&ty).is_ok());
        }
    }

    #[test]
    fn pointer_bearing_types_rejected() {
        let types: [Type; 7] = [
            parse_quote!(Vec<u8>),
            parse_quote!(String),
            parse_quote!(Box<u64>),
            parse_quote!(Arc<u64>),
            parse_quote!(&u32),
            parse_quote!(*mut u8),
            parse_quote!(Mutex<u64>),
        ];
        for ty in types {
            assert!(reject_unshareable(&ty).is_err(), "{}", quote!(#ty));
        }
    }

    #[test]
    fn nested_forbidden_types_rejected() {
        let types: [Type; 3] = [
            parse_quote!(Option<Vec<u8>>),
            parse_quote!((u32, Box<u64>)),
            parse_quote!([Mutex<u64>; 4]),
        ];
        for ty in types {
            assert!(reject_unshareable(&ty).is_err());
        }
    }

    #[test]
    fn union_rejected() {
        let input: DeriveInput = parse_quote! {
            union Raw { a: u32, b: f32 }
        };
        assert!(field_types(&input.data).is_err());
    }
}
