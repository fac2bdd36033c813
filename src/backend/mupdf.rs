//! MuPDF implementation of the backend traits
//!
//! MuPDF authenticates owner passwords as full credentials and writes
//! unencrypted copies without enforcing permissions. An owner password
//! therefore unlocks like a user password here, and the owner-restriction
//! failures the password gate looks for never occur with this backend.

use std::path::Path;

use mupdf::pdf::{Encryption, PdfDocument, PdfWriteOptions};
use mupdf::{Colorspace, Document, Matrix, Page};

use super::{Access, RasterBackend, RewriteMode, SecurityBackend, Unlocked};
use crate::error::BackendError;
use crate::render::bitmap::Bitmap;

/// MuPDF-backed security and raster operations
#[derive(Debug, Default, Clone, Copy)]
pub struct MuPdfBackend;

impl MuPdfBackend {
    pub fn new() -> Self {
        Self
    }
}

/// An open MuPDF document
pub struct MuPdfDocument {
    doc: Document,
}

/// A loaded MuPDF page with its bounds in points
pub struct MuPdfPage {
    page: Page,
    width: f32,
    height: f32,
}

// SAFETY: MuPDF handles are not thread-safe, but they are never shared.
// A document and its pages are owned by one renderer slot and only
// touched while that slot's mutex is held, so at most one thread uses
// them at a time. Moving them between threads is fine; the handles carry
// no thread-local state.
unsafe impl Send for MuPdfDocument {}
unsafe impl Send for MuPdfPage {}

fn path_str(path: &Path) -> Result<&str, BackendError> {
    path.to_str()
        .ok_or_else(|| BackendError::new(format!("path is not valid UTF-8: {}", path.display())))
}

/// MuPDF takes the password as a UTF-8 C string
///
/// Raw byte variants such as the Latin-1 encoding cannot be passed through
/// and are rejected like a wrong password; the gate moves on to the next one.
fn password_str(password: &[u8]) -> Result<&str, BackendError> {
    std::str::from_utf8(password)
        .ok()
        .filter(|p| !p.contains('\0'))
        .ok_or_else(|| BackendError::new("bad user password: variant is not representable"))
}

fn page_count_of(doc: &Document) -> Result<usize, BackendError> {
    let count = doc.page_count()?;
    Ok(count.max(0) as usize)
}

impl SecurityBackend for MuPdfBackend {
    fn probe(&self, path: &Path) -> Result<usize, BackendError> {
        let doc = Document::open(path_str(path)?)?;
        if doc.needs_password()? {
            return Err(BackendError::new("document is encrypted: password required"));
        }
        page_count_of(&doc)
    }

    fn unlock(&self, path: &Path, password: &[u8]) -> Result<Unlocked, BackendError> {
        let mut doc = Document::open(path_str(path)?)?;
        if !doc.needs_password()? {
            return Ok(Unlocked {
                page_count: page_count_of(&doc)?,
                access: Access::Open,
            });
        }
        if !doc.authenticate(password_str(password)?)? {
            return Err(BackendError::new("bad user password"));
        }
        Ok(Unlocked {
            page_count: page_count_of(&doc)?,
            access: Access::Authenticated,
        })
    }

    fn rewrite_unencrypted(
        &self,
        source: &Path,
        password: &[u8],
        dest: &Path,
        mode: RewriteMode,
    ) -> Result<usize, BackendError> {
        let mut doc = PdfDocument::open(path_str(source)?)?;
        if doc.needs_password()? {
            let authenticated = doc.authenticate(password_str(password)?)?;
            // An owner-only document opens with the empty password; permissive
            // mode may fall back to it, a user password is still required
            let authenticated =
                authenticated || (mode == RewriteMode::Permissive && doc.authenticate("")?);
            if !authenticated {
                return Err(BackendError::new("bad user password"));
            }
        }
        let page_count = page_count_of(&doc)?;

        let mut options = PdfWriteOptions::default();
        options.set_encryption(Encryption::None);
        doc.save_with_options(path_str(dest)?, options)?;

        tracing::debug!("Wrote unencrypted copy ({} pages, {:?})", page_count, mode);
        Ok(page_count)
    }
}

impl RasterBackend for MuPdfBackend {
    type Document = MuPdfDocument;
    type Page = MuPdfPage;

    fn open(&self, path: &Path) -> Result<MuPdfDocument, BackendError> {
        let doc = Document::open(path_str(path)?)?;
        if doc.needs_password()? {
            return Err(BackendError::new("document is encrypted"));
        }
        Ok(MuPdfDocument { doc })
    }

    fn page_count(&self, document: &MuPdfDocument) -> Result<usize, BackendError> {
        page_count_of(&document.doc)
    }

    fn load_page(&self, document: &MuPdfDocument, index: usize) -> Result<MuPdfPage, BackendError> {
        let index = i32::try_from(index)
            .map_err(|_| BackendError::new(format!("page index {} too large", index)))?;
        let page = document.doc.load_page(index)?;
        let bounds = page.bounds()?;
        Ok(MuPdfPage {
            width: bounds.x1 - bounds.x0,
            height: bounds.y1 - bounds.y0,
            page,
        })
    }

    fn page_size(&self, page: &MuPdfPage) -> Result<(u32, u32), BackendError> {
        // Points map 1:1 to pixels at 72 dpi
        Ok((
            page.width.max(0.0).round() as u32,
            page.height.max(0.0).round() as u32,
        ))
    }

    fn draw(&self, page: &MuPdfPage, target: &mut Bitmap) -> Result<(), BackendError> {
        if page.width <= 0.0 || page.height <= 0.0 {
            return Err(BackendError::new("page has no area"));
        }
        let scale_x = target.width() as f32 / page.width;
        let scale_y = target.height() as f32 / page.height;
        let matrix = Matrix::new_scale(scale_x, scale_y);
        let colorspace = Colorspace::device_rgb();
        let pixmap = page.page.to_pixmap(&matrix, &colorspace, false, true)?;

        let width = (pixmap.width() as u32).min(target.width());
        let height = (pixmap.height() as u32).min(target.height());
        let stride = pixmap.width() as usize;
        let samples = pixmap.samples();
        let n = pixmap.n() as usize;

        for y in 0..height {
            for x in 0..width {
                let offset = (y as usize * stride + x as usize) * n;
                let r = samples.get(offset).copied().unwrap_or(255);
                let g = samples.get(offset + 1).copied().unwrap_or(255);
                let b = samples.get(offset + 2).copied().unwrap_or(255);
                let a = if n >= 4 {
                    samples.get(offset + 3).copied().unwrap_or(255)
                } else {
                    255
                };
                target.put_pixel(x, y, [r, g, b, a]);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Single-page 200x300pt PDF
    const MINIMAL_PDF: &[u8] = b"%PDF-1.4
1 0 obj
<< /Type /Catalog /Pages 2 0 R >>
endobj
2 0 obj
<< /Type /Pages /Kids [3 0 R] /Count 1 >>
endobj
3 0 obj
<< /Type /Page /Parent 2 0 R /MediaBox [0 0 200 300] >>
endobj
xref
0 4
0000000000 65535 f
0000000009 00000 n
0000000058 00000 n
0000000115 00000 n
trailer
<< /Size 4 /Root 1 0 R >>
startxref
186
%%EOF";

    fn write_pdf() -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".pdf").tempfile().unwrap();
        file.write_all(MINIMAL_PDF).unwrap();
        file.flush().unwrap();
        file
    }

    /// The minimal PDF re-saved with separate user and owner passwords
    fn write_encrypted(user: &str, owner: &str) -> tempfile::NamedTempFile {
        let plain = write_pdf();
        let file = tempfile::Builder::new().suffix(".pdf").tempfile().unwrap();
        let doc = PdfDocument::open(plain.path().to_str().unwrap()).unwrap();
        let mut options = PdfWriteOptions::default();
        options.set_encryption(Encryption::Aes128);
        options.set_user_password(user);
        options.set_owner_password(owner);
        doc.save_with_options(file.path().to_str().unwrap(), options).unwrap();
        file
    }

    #[test]
    #[ignore] // Requires the native MuPDF library
    fn test_probe_unencrypted() {
        let file = write_pdf();
        assert_eq!(MuPdfBackend.probe(file.path()).unwrap(), 1);
        let unlocked = MuPdfBackend.unlock(file.path(), b"anything").unwrap();
        assert_eq!(unlocked.access, Access::Open);
    }

    #[test]
    #[ignore] // Requires the native MuPDF library
    fn test_render_page() {
        let file = write_pdf();
        let backend = MuPdfBackend;
        let doc = RasterBackend::open(&backend, file.path()).unwrap();
        assert_eq!(backend.page_count(&doc).unwrap(), 1);

        let page = backend.load_page(&doc, 0).unwrap();
        assert_eq!(backend.page_size(&page).unwrap(), (200, 300));

        let mut bitmap = Bitmap::try_new(100, 150).unwrap();
        backend.draw(&page, &mut bitmap).unwrap();
        // Blank page renders white
        assert_eq!(&bitmap.pixels()[0..4], &[255, 255, 255, 255]);
    }

    #[test]
    #[ignore] // Requires the native MuPDF library
    fn test_rewrite_plain_document() {
        let file = write_pdf();
        let dest = tempfile::Builder::new().suffix(".pdf").tempfile().unwrap();
        let pages = MuPdfBackend
            .rewrite_unencrypted(file.path(), b"", dest.path(), RewriteMode::Standard)
            .unwrap();
        assert_eq!(pages, 1);
        assert_eq!(MuPdfBackend.probe(dest.path()).unwrap(), 1);
    }

    #[test]
    #[ignore] // Requires the native MuPDF library
    fn test_owner_password_unlocks_fully() {
        let file = write_encrypted("user1", "owner1");
        assert!(MuPdfBackend.probe(file.path()).is_err());
        assert!(MuPdfBackend.unlock(file.path(), b"wrong").is_err());

        let unlocked = MuPdfBackend.unlock(file.path(), b"owner1").unwrap();
        assert_eq!(unlocked.access, Access::Authenticated);
        assert_eq!(unlocked.page_count, 1);

        let dest = tempfile::Builder::new().suffix(".pdf").tempfile().unwrap();
        let pages = MuPdfBackend
            .rewrite_unencrypted(file.path(), b"owner1", dest.path(), RewriteMode::Standard)
            .unwrap();
        assert_eq!(pages, 1);
        assert_eq!(MuPdfBackend.probe(dest.path()).unwrap(), 1);
    }

    #[test]
    #[ignore] // Requires the native MuPDF library
    fn test_gate_accepts_owner_password() {
        use crate::config::PasswordConfig;
        use crate::password::{PasswordGate, Validation};
        use std::sync::Arc;

        let file = write_encrypted("user1", "owner1");
        let dir = tempfile::tempdir().unwrap();
        let gate = PasswordGate::new(
            Arc::new(MuPdfBackend),
            &PasswordConfig::default(),
            Some(dir.path().to_path_buf()),
        );
        assert!(gate.is_encrypted(file.path()));
        assert_eq!(gate.validate(file.path(), "owner1"), Validation::Valid);

        let copy = gate.decrypt(file.path(), "owner1").unwrap();
        assert_eq!(copy.page_count(), 1);
    }

    #[test]
    fn test_password_must_be_c_string() {
        assert!(password_str(b"ok").is_ok());
        assert!(password_str(b"a\0b").is_err());
        assert!(password_str(&[0xff, 0xfe]).is_err());
        // Latin-1 "päss" is not UTF-8
        assert!(password_str(b"p\xe4ss").is_err());
    }
}
