use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, Data, DeriveInput, Field, Fields, Ident};

/// Generates an `Entity` impl from field shape alone: a Rust reflection
/// mechanism being unavailable, each entity type needs its own
/// reader/writer functions (`rustorm::entity`'s module doc), and this macro
/// is what spares application authors from hand-writing them.
///
/// Field kinds, inferred from attributes:
/// - `#[entity(id)]` — the primary key; must be typed `Option<Value>`.
/// - `#[entity(relation)]` — a to-one association; must be typed `RelatedValue`.
/// - `#[entity(many_to_many)]` — a membership collection; must be typed `Vec<Value>`.
/// - anything else — a plain scalar column typed `Value`.
///
/// `#[entity(class = "...")]` on the struct overrides the class name used to
/// look the type up in the metadata registry; it defaults to the struct's
/// own name.
#[proc_macro_derive(Entity, attributes(entity))]
pub fn derive_entity(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand_entity(input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

enum FieldKind {
    Id,
    Relation,
    ManyToMany,
    Scalar,
}

fn field_kind(field: &Field) -> syn::Result<FieldKind> {
    for attr in &field.attrs {
        if !attr.path().is_ident("entity") {
            continue;
        }
        let mut kind = None;
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("id") {
                kind = Some(FieldKind::Id);
            } else if meta.path.is_ident("relation") {
                kind = Some(FieldKind::Relation);
            } else if meta.path.is_ident("many_to_many") {
                kind = Some(FieldKind::ManyToMany);
            }
            Ok(())
        })?;
        if let Some(kind) = kind {
            return Ok(kind);
        }
    }
    Ok(FieldKind::Scalar)
}

fn struct_class_name(ident: &Ident, attrs: &[Attribute]) -> syn::Result<String> {
    for attr in attrs {
        if !attr.path().is_ident("entity") {
            continue;
        }
        let mut class = None;
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("class") {
                let value = meta.value()?;
                let lit: syn::LitStr = value.parse()?;
                class = Some(lit.value());
            }
            Ok(())
        })?;
        if let Some(class) = class {
            return Ok(class);
        }
    }
    Ok(ident.to_string())
}

fn expand_entity(input: DeriveInput) -> syn::Result<TokenStream2> {
    let struct_name = &input.ident;

    if !input.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            input.generics,
            "Entity does not support generic structs",
        ));
    }

    let data = match input.data {
        Data::Struct(data) => data,
        _ => return Err(syn::Error::new_spanned(struct_name, "Entity can only be derived for structs")),
    };
    let fields = match data.fields {
        Fields::Named(fields) => fields.named,
        _ => return Err(syn::Error::new_spanned(struct_name, "Entity requires named fields")),
    };

    let class_name = struct_class_name(struct_name, &input.attrs)?;

    let mut id_field: Option<Ident> = None;
    let mut scalar_fields = Vec::new();
    let mut relation_fields = Vec::new();
    let mut many_to_many_fields = Vec::new();

    for field in &fields {
        let ident = field
            .ident
            .clone()
            .ok_or_else(|| syn::Error::new_spanned(field, "Entity requires named fields"))?;
        match field_kind(field)? {
            FieldKind::Id => {
                if id_field.is_some() {
                    return Err(syn::Error::new_spanned(field, "only one #[entity(id)] field is allowed"));
                }
                id_field = Some(ident);
            }
            FieldKind::Relation => relation_fields.push(ident),
            FieldKind::ManyToMany => many_to_many_fields.push(ident),
            FieldKind::Scalar => scalar_fields.push(ident),
        }
    }

    let id_field = id_field.ok_or_else(|| {
        syn::Error::new_spanned(struct_name, "Entity requires exactly one field marked #[entity(id)]")
    })?;

    let scalar_names: Vec<String> = scalar_fields.iter().map(Ident::to_string).collect();
    let relation_names: Vec<String> = relation_fields.iter().map(Ident::to_string).collect();
    let m2m_names: Vec<String> = many_to_many_fields.iter().map(Ident::to_string).collect();

    let expanded = quote! {
        impl ::rustorm::entity::Entity for #struct_name {
            fn class_name(&self) -> &'static str {
                #class_name
            }

            fn primary_key(&self) -> Option<::rustorm::value::Value> {
                self.#id_field.clone()
            }

            fn set_primary_key(&mut self, value: ::rustorm::value::Value) {
                self.#id_field = Some(value);
            }

            fn get_column(&self, field: &str) -> Option<::rustorm::value::Value> {
                match field {
                    #(#scalar_names => Some(self.#scalar_fields.clone()),)*
                    _ => None,
                }
            }

            fn set_column(&mut self, field: &str, value: ::rustorm::value::Value) {
                match field {
                    #(#scalar_names => self.#scalar_fields = value,)*
                    _ => {}
                }
            }

            fn get_relation(&self, field: &str) -> ::rustorm::entity::RelatedValue {
                use ::rustorm::entity::RelatedValue;
                match field {
                    #(#relation_names => match &self.#relation_fields {
                        RelatedValue::None => RelatedValue::None,
                        RelatedValue::Id(v) => RelatedValue::Id(v.clone()),
                        RelatedValue::Pending(h) => RelatedValue::Pending(*h),
                        RelatedValue::New(_) => RelatedValue::None,
                    },)*
                    _ => RelatedValue::None,
                }
            }

            fn set_relation_id(&mut self, field: &str, value: Option<::rustorm::value::Value>) {
                use ::rustorm::entity::RelatedValue;
                match field {
                    #(#relation_names => {
                        self.#relation_fields = value.map(RelatedValue::Id).unwrap_or(RelatedValue::None);
                    })*
                    _ => {}
                }
            }

            fn take_relation_new(&mut self, field: &str) -> Option<Box<dyn ::rustorm::entity::Entity>> {
                use ::rustorm::entity::RelatedValue;
                match field {
                    #(#relation_names => match ::std::mem::replace(&mut self.#relation_fields, RelatedValue::None) {
                        RelatedValue::New(boxed) => Some(boxed),
                        other => {
                            self.#relation_fields = other;
                            None
                        }
                    },)*
                    _ => None,
                }
            }

            fn set_relation_pending(&mut self, field: &str, handle: ::rustorm::entity::EntityHandle) {
                use ::rustorm::entity::RelatedValue;
                match field {
                    #(#relation_names => self.#relation_fields = RelatedValue::Pending(handle),)*
                    _ => {}
                }
            }

            fn get_many_to_many(&self, field: &str) -> Vec<::rustorm::value::Value> {
                match field {
                    #(#m2m_names => self.#many_to_many_fields.clone(),)*
                    _ => Vec::new(),
                }
            }

            fn as_any(&self) -> &dyn ::std::any::Any {
                self
            }

            fn as_any_mut(&mut self) -> &mut dyn ::std::any::Any {
                self
            }
        }
    };

    Ok(expanded)
}
