//! Step-through editor for imported items. Each item is reviewed, then
//! handed to the upload queue while the editor moves on to the next one.

use crate::images::{ImageSize, ProxyOptions, proxy_url};
use crate::models::{
    EnrichedFields, ImageInput, ListingDraft, ListingType, PriceField, SourceItem, TagError, TagSet,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum EditorError {
    #[error("no item to edit")]
    NoItem,
    #[error(transparent)]
    Tag(#[from] TagError),
    #[error("title and price are required")]
    Incomplete,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EditorItem {
    pub id: String,
    pub name: String,
    pub price: PriceField,
    pub description: String,
    pub tags: TagSet,
    pub images: Vec<String>,
}

impl From<SourceItem> for EditorItem {
    fn from(item: SourceItem) -> Self {
        let images = item.display_images();
        let fields = item
            .fields
            .unwrap_or_else(|| EnrichedFields::fallback(&item.caption));
        Self {
            id: item.id,
            name: fields.name,
            // An unknown price is left for the seller to fill in.
            price: if fields.price > 0.0 {
                PriceField::Amount(fields.price)
            } else {
                PriceField::default()
            },
            description: if fields.description.is_empty() {
                item.caption
            } else {
                fields.description
            },
            tags: TagSet::from(fields.tags),
            images,
        }
    }
}

/// Partial update of the current item; absent fields are left alone.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FieldUpdate {
    pub name: Option<String>,
    pub price: Option<PriceField>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EditorView {
    pub index: usize,
    pub total: usize,
    pub item: EditorItem,
    pub thumbnails: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ImportEditor {
    items: Vec<EditorItem>,
    current: usize,
}

impl ImportEditor {
    pub fn new(items: Vec<SourceItem>) -> Self {
        Self {
            items: items.into_iter().map(EditorItem::from).collect(),
            current: 0,
        }
    }

    pub fn view(&self) -> Option<EditorView> {
        let thumb = ProxyOptions::sized(ImageSize::Thumbnail);
        self.items.get(self.current).map(|item| EditorView {
            index: self.current,
            total: self.items.len(),
            thumbnails: item.images.iter().map(|url| proxy_url(url, &thumb)).collect(),
            item: item.clone(),
        })
    }

    fn current_mut(&mut self) -> Result<&mut EditorItem, EditorError> {
        self.items.get_mut(self.current).ok_or(EditorError::NoItem)
    }

    pub fn update(&mut self, update: FieldUpdate) -> Result<(), EditorError> {
        let item = self.current_mut()?;
        if let Some(name) = update.name {
            item.name = name;
        }
        if let Some(price) = update.price {
            item.price = price;
        }
        if let Some(description) = update.description {
            item.description = description;
        }
        Ok(())
    }

    /// `Ok(false)` when the tag was blank and nothing changed.
    pub fn add_tag(&mut self, raw: &str) -> Result<bool, EditorError> {
        Ok(self.current_mut()?.tags.add(raw)?)
    }

    pub fn remove_tag(&mut self, idx: usize) -> Result<(), EditorError> {
        self.current_mut()?.tags.remove_at(idx);
        Ok(())
    }

    pub fn remove_image(&mut self, idx: usize) -> Result<(), EditorError> {
        let item = self.current_mut()?;
        if idx < item.images.len() {
            item.images.remove(idx);
        }
        Ok(())
    }

    /// Draft for the current item. The editor does not move until [`Self::advance`].
    pub fn draft(&self, listing_type: ListingType) -> Result<ListingDraft, EditorError> {
        let item = self.items.get(self.current).ok_or(EditorError::NoItem)?;
        if item.name.trim().is_empty() || item.price.is_blank() {
            return Err(EditorError::Incomplete);
        }
        Ok(ListingDraft {
            name: item.name.clone(),
            price: item.price.clone(),
            description: item.description.clone(),
            tags: item.tags.clone(),
            images: item.images.iter().cloned().map(ImageInput::Remote).collect(),
            listing_type,
        })
    }

    /// Moves to the next item. Returns `true` once every item has been handed off.
    pub fn advance(&mut self) -> bool {
        if self.current < self.items.len() {
            self.current += 1;
        }
        self.current >= self.items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, fields: Option<EnrichedFields>) -> SourceItem {
        SourceItem {
            id: id.into(),
            images: vec![],
            display_url: Some(format!("https://cdn/{id}.jpg")),
            caption: format!("caption {id}"),
            fields,
        }
    }

    fn enriched(name: &str, price: f64) -> EnrichedFields {
        EnrichedFields {
            name: name.into(),
            price,
            currency: "USD".into(),
            description: String::new(),
            tags: vec!["denim".into()],
        }
    }

    #[test]
    fn items_start_from_enrichment() {
        let editor = ImportEditor::new(vec![item("a", Some(enriched("Levi's", 35.0)))]);
        let view = editor.view().unwrap();
        assert_eq!(view.total, 1);
        assert_eq!(view.item.name, "Levi's");
        assert_eq!(view.item.price, PriceField::Amount(35.0));
        assert_eq!(view.item.description, "caption a");
        assert_eq!(view.item.images, vec!["https://cdn/a.jpg"]);
        assert_eq!(view.item.tags.as_slice(), ["denim"]);
        assert!(view.thumbnails[0].contains("&w=150&"));
    }

    #[test]
    fn tags_follow_the_set_rules() {
        let mut editor = ImportEditor::new(vec![item("a", Some(enriched("tee", 5.0)))]);
        assert_eq!(editor.add_tag("  "), Ok(false));
        assert_eq!(editor.add_tag("DENIM"), Err(EditorError::Tag(TagError::Duplicate)));
        for tag in ["a", "b", "c", "d"] {
            assert_eq!(editor.add_tag(tag), Ok(true));
        }
        assert_eq!(editor.add_tag("f"), Err(EditorError::Tag(TagError::Full)));
        editor.remove_tag(0).unwrap();
        editor.remove_tag(42).unwrap();
        assert_eq!(editor.view().unwrap().item.tags.len(), 4);
    }

    #[test]
    fn draft_requires_title_and_price() {
        let mut editor = ImportEditor::new(vec![item("a", Some(enriched("Untitled Item", 0.0)))]);
        assert_eq!(editor.draft(ListingType::Standard).unwrap_err(), EditorError::Incomplete);

        editor
            .update(FieldUpdate {
                price: Some(PriceField::Text("12".into())),
                ..FieldUpdate::default()
            })
            .unwrap();
        let draft = editor.draft(ListingType::TimeBoxed).unwrap();
        assert_eq!(draft.listing_type, ListingType::TimeBoxed);
        assert_eq!(draft.images, vec![ImageInput::Remote("https://cdn/a.jpg".into())]);
    }

    #[test]
    fn advance_walks_to_the_end() {
        let mut editor = ImportEditor::new(vec![item("a", None), item("b", None)]);
        editor.remove_image(0).unwrap();
        editor.remove_image(5).unwrap();
        assert!(editor.view().unwrap().item.images.is_empty());

        assert!(!editor.advance());
        assert_eq!(editor.view().unwrap().item.id, "b");
        assert!(editor.advance());
        assert!(editor.view().is_none());
        assert_eq!(editor.add_tag("x"), Err(EditorError::NoItem));
        assert!(editor.advance());
    }
}
