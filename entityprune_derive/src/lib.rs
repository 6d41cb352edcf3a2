use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{Data, DeriveInput, Fields, Ident, LitStr, Type, parse_macro_input, spanned::Spanned};

/// Generates `Prunable` (and `Entity` when a `#[prune(meta)]` field exists).
///
/// Field options: `id`, `version`, `reference`, `collection`, `target = Type`,
/// `mapped_by = "field"`, `transient`, `base`, `meta`, `skip`.
/// Struct options: `name = "..."`.
#[proc_macro_derive(Prunable, attributes(prune))]
pub fn derive_prunable(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand_prunable(input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FieldShape {
    Value,
    Reference,
    Collection,
}

#[derive(Default)]
struct FieldOptions {
    id: bool,
    version: bool,
    reference: bool,
    collection: bool,
    transient: bool,
    base: bool,
    meta: bool,
    skip: bool,
    target: Option<Type>,
    mapped_by: Option<LitStr>,
}

impl FieldOptions {
    fn shape(&self) -> FieldShape {
        if self.reference {
            FieldShape::Reference
        } else if self.collection {
            FieldShape::Collection
        } else {
            FieldShape::Value
        }
    }
}

struct CataloguedField {
    ident: Ident,
    ty: Type,
    index: usize,
    options: FieldOptions,
}

fn expand_prunable(input: DeriveInput) -> syn::Result<TokenStream2> {
    let struct_name = input.ident;

    if !input.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            input.generics,
            "Prunable does not support generic structs",
        ));
    }

    let type_name = parse_struct_name(&input.attrs)?
        .unwrap_or_else(|| LitStr::new(&struct_name.to_string(), struct_name.span()));

    let data_struct = match input.data {
        Data::Struct(data) => data,
        _ => {
            return Err(syn::Error::new(
                struct_name.span(),
                "Prunable can only be derived for structs",
            ));
        }
    };

    let named_fields = match data_struct.fields {
        Fields::Named(fields) => fields,
        _ => {
            return Err(syn::Error::new(
                struct_name.span(),
                "Prunable requires named fields",
            ));
        }
    };

    let mut catalogued = Vec::<CataloguedField>::new();
    let mut base: Option<(Ident, Type)> = None;
    let mut meta: Option<Ident> = None;
    let mut id_field: Option<Ident> = None;

    for field in named_fields.named {
        let span = field.span();
        let ident = field
            .ident
            .clone()
            .ok_or_else(|| syn::Error::new(span, "Prunable requires named fields"))?;
        let options = parse_field_options(&field.attrs)?;

        if options.skip {
            continue;
        }

        if options.base {
            if base.is_some() {
                return Err(syn::Error::new(span, "only one #[prune(base)] field is allowed"));
            }
            base = Some((ident, field.ty));
            continue;
        }

        if options.meta {
            if meta.is_some() {
                return Err(syn::Error::new(span, "only one #[prune(meta)] field is allowed"));
            }
            meta = Some(ident);
            continue;
        }

        if options.id {
            if id_field.is_some() {
                return Err(syn::Error::new(span, "only one #[prune(id)] field is allowed"));
            }
            id_field = Some(ident.clone());
        }

        let index = catalogued.len();
        catalogued.push(CataloguedField {
            ident,
            ty: field.ty,
            index,
            options,
        });
    }

    let field_exprs = catalogued.iter().map(field_descriptor_expr);

    let with_base = base.as_ref().map(|(_, base_ty)| {
        quote! {
            .with_base(<#base_ty as ::entityprune::Prunable>::describe())
        }
    });

    let (base_slot, base_slot_mut) = match &base {
        Some((base_ident, _)) => (
            quote!(::entityprune::Prunable::slot(&self.#base_ident, field)),
            quote!(::entityprune::Prunable::slot_mut(&mut self.#base_ident, field)),
        ),
        None => (
            quote!(::core::option::Option::None),
            quote!(::core::option::Option::None),
        ),
    };

    let slot_arms = catalogued.iter().map(|field| {
        let ident = &field.ident;
        let index = field.index;
        let variant = slot_variant(field.options.shape());
        quote! {
            #index => ::core::option::Option::Some(::entityprune::catalog::Slot::#variant(&self.#ident)),
        }
    });

    let slot_mut_arms = catalogued.iter().map(|field| {
        let ident = &field.ident;
        let index = field.index;
        let variant = slot_variant(field.options.shape());
        quote! {
            #index => ::core::option::Option::Some(::entityprune::catalog::SlotMut::#variant(&mut self.#ident)),
        }
    });

    let identifier_body = match (&id_field, &base) {
        (Some(id), _) => quote! {
            ::core::clone::Clone::clone(&self.#id).map(::entityprune::core::Identifier::from)
        },
        (None, Some((base_ident, _))) => quote! {
            ::entityprune::Prunable::identifier(&self.#base_ident)
        },
        (None, None) => quote!(::core::option::Option::None),
    };

    let entity_impl = meta.as_ref().map(|meta_ident| {
        quote! {
            impl ::entityprune::Entity for #struct_name {
                fn entity_type(&self) -> ::std::sync::Arc<::entityprune::catalog::EntityType> {
                    ::entityprune::catalog::entity_type_of::<Self>()
                }

                fn pruning(&self) -> &::entityprune::core::PruningMeta {
                    &self.#meta_ident
                }

                fn pruning_mut(&mut self) -> &mut ::entityprune::core::PruningMeta {
                    &mut self.#meta_ident
                }

                fn as_any(&self) -> &dyn ::std::any::Any {
                    self
                }

                fn as_any_mut(&mut self) -> &mut dyn ::std::any::Any {
                    self
                }
            }
        }
    });

    Ok(quote! {
        impl ::entityprune::Prunable for #struct_name {
            fn describe() -> ::entityprune::catalog::TypeDescription {
                ::entityprune::catalog::TypeDescription::new::<Self>(<Self as ::entityprune::Prunable>::entity_name())
                    #with_base
                    #(.field(#field_exprs))*
            }

            fn entity_name() -> &'static str {
                #type_name
            }

            fn slot(
                &self,
                field: &::entityprune::catalog::FieldDescriptor,
            ) -> ::core::option::Option<::entityprune::catalog::Slot<'_>> {
                if field.owner() != ::std::any::TypeId::of::<Self>() {
                    return #base_slot;
                }
                match field.index() {
                    #(#slot_arms)*
                    _ => ::core::option::Option::None,
                }
            }

            fn slot_mut(
                &mut self,
                field: &::entityprune::catalog::FieldDescriptor,
            ) -> ::core::option::Option<::entityprune::catalog::SlotMut<'_>> {
                if field.owner() != ::std::any::TypeId::of::<Self>() {
                    return #base_slot_mut;
                }
                match field.index() {
                    #(#slot_mut_arms)*
                    _ => ::core::option::Option::None,
                }
            }

            fn identifier(&self) -> ::core::option::Option<::entityprune::core::Identifier> {
                #identifier_body
            }
        }

        #entity_impl
    })
}

fn slot_variant(shape: FieldShape) -> TokenStream2 {
    match shape {
        FieldShape::Value => quote!(Value),
        FieldShape::Reference => quote!(Reference),
        FieldShape::Collection => quote!(Collection),
    }
}

fn field_descriptor_expr(field: &CataloguedField) -> TokenStream2 {
    let name = LitStr::new(&field.ident.to_string(), field.ident.span());
    let index = field.index;
    let ty = &field.ty;
    let options = &field.options;

    let base = match options.shape() {
        FieldShape::Value => quote! {
            ::entityprune::catalog::FieldDescriptor::value::<Self>(#name, #index, stringify!(#ty))
        },
        FieldShape::Reference => {
            // presence of `target` is checked while parsing
            let target = options.target.as_ref().map(|target| {
                quote!(::entityprune::catalog::TargetType::of::<#target>())
            });
            quote! {
                ::entityprune::catalog::FieldDescriptor::reference::<Self>(
                    #name,
                    #index,
                    stringify!(#ty),
                    #target,
                )
            }
        }
        FieldShape::Collection => {
            let target = match &options.target {
                Some(target) => quote! {
                    ::core::option::Option::Some(::entityprune::catalog::TargetType::of::<#target>())
                },
                None => quote!(::core::option::Option::None),
            };
            let mapped_by = match &options.mapped_by {
                Some(mapped_by) => quote!(::core::option::Option::Some(#mapped_by)),
                None => quote!(::core::option::Option::None),
            };
            quote! {
                ::entityprune::catalog::FieldDescriptor::collection::<Self>(
                    #name,
                    #index,
                    stringify!(#ty),
                    #target,
                    #mapped_by,
                )
            }
        }
    };

    let role = if options.id {
        Some(quote!(.with_role(::entityprune::catalog::FieldRole::Identifier)))
    } else if options.version {
        Some(quote!(.with_role(::entityprune::catalog::FieldRole::Version)))
    } else {
        None
    };
    let transient = options.transient.then(|| quote!(.transient()));

    quote!(#base #role #transient)
}

fn parse_struct_name(attrs: &[syn::Attribute]) -> syn::Result<Option<LitStr>> {
    let mut name = None;
    for attr in attrs {
        if !attr.path().is_ident("prune") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("name") {
                let value = meta.value()?;
                name = Some(value.parse::<LitStr>()?);
                return Ok(());
            }
            Err(meta.error("Unsupported #[prune(...)] option on struct. Supported: name = \"...\""))
        })?;
    }
    Ok(name)
}

fn parse_field_options(attrs: &[syn::Attribute]) -> syn::Result<FieldOptions> {
    let mut options = FieldOptions::default();
    let mut seen = false;

    for attr in attrs {
        if !attr.path().is_ident("prune") {
            continue;
        }
        seen = true;

        attr.parse_nested_meta(|meta| {
            let flag = if meta.path.is_ident("id") {
                &mut options.id
            } else if meta.path.is_ident("version") {
                &mut options.version
            } else if meta.path.is_ident("reference") {
                &mut options.reference
            } else if meta.path.is_ident("collection") {
                &mut options.collection
            } else if meta.path.is_ident("transient") {
                &mut options.transient
            } else if meta.path.is_ident("base") {
                &mut options.base
            } else if meta.path.is_ident("meta") {
                &mut options.meta
            } else if meta.path.is_ident("skip") {
                &mut options.skip
            } else if meta.path.is_ident("target") {
                options.target = Some(meta.value()?.parse::<Type>()?);
                return Ok(());
            } else if meta.path.is_ident("mapped_by") {
                options.mapped_by = Some(meta.value()?.parse::<LitStr>()?);
                return Ok(());
            } else {
                return Err(meta.error(
                    "Unsupported #[prune(...)] option. Supported: id, version, reference, collection, target = Type, mapped_by = \"...\", transient, base, meta, skip",
                ));
            };
            *flag = true;
            Ok(())
        })?;
    }

    if seen {
        validate_field_options(attrs, &options)?;
    }
    Ok(options)
}

fn validate_field_options(attrs: &[syn::Attribute], options: &FieldOptions) -> syn::Result<()> {
    let span = attrs
        .iter()
        .find(|attr| attr.path().is_ident("prune"))
        .map(|attr| attr.span())
        .unwrap_or_else(proc_macro2::Span::call_site);

    if options.reference && options.collection {
        return Err(syn::Error::new(
            span,
            "#[prune(reference)] cannot be combined with #[prune(collection)]",
        ));
    }

    if options.reference && options.target.is_none() {
        return Err(syn::Error::new(
            span,
            "#[prune(reference)] requires `target = Type`",
        ));
    }

    if options.mapped_by.is_some() && !options.collection {
        return Err(syn::Error::new(
            span,
            "`mapped_by` is only valid on #[prune(collection)] fields",
        ));
    }

    if options.target.is_some() && !options.reference && !options.collection {
        return Err(syn::Error::new(
            span,
            "`target` is only valid on reference or collection fields",
        ));
    }

    if (options.id || options.version) && (options.reference || options.collection) {
        return Err(syn::Error::new(
            span,
            "#[prune(id)] and #[prune(version)] mark plain attributes",
        ));
    }

    let structural = [options.base, options.meta, options.skip]
        .into_iter()
        .filter(|flag| *flag)
        .count();
    let other = options.id
        || options.version
        || options.reference
        || options.collection
        || options.transient
        || options.target.is_some()
        || options.mapped_by.is_some();
    if structural > 1 || (structural == 1 && other) {
        return Err(syn::Error::new(
            span,
            "#[prune(base)], #[prune(meta)] and #[prune(skip)] cannot be combined with other options",
        ));
    }

    Ok(())
}
