//!
//! # External Cell References
//!
//! Cells defined in other libraries are stored as references: name, view, dates,
//! bounds, the path of their library, and the names of their exports.
//! Each referenced library is located and read (once), and each referenced cell checked
//! against what the referencing library expects of it.
//! References which cannot be satisfied are replaced by placeholder cells.
//!

// Std-Lib Imports
use std::path::PathBuf;

// Crates.io
use log::{debug, info};

// Workspace Imports
use elib21utils::ErrorHelper;

// Local Imports
use crate::build::cell_techs;
use crate::config::MissingLibraryPolicy;
use crate::data::*;
use crate::read::{ElibParser, RawExternal};
use crate::resolve::soft_error;

/// Tolerance for comparing cell sizes, in file units
const EPSILON: f64 = 1e-6;

/// Boolean indication of whether `w` x `h` and `cw` x `ch` have equal aspect ratios,
/// to within [EPSILON] relative to their magnitudes
fn same_aspect(w: f64, h: f64, cw: f64, ch: f64) -> bool {
    let (a, b) = (w * ch, cw * h);
    (a - b).abs() <= EPSILON * a.abs().max(b.abs()).max(1.0)
}

/// Split a stored library path into its file name and library name.
/// Paths may have been written with any of '/', '\' or ':' separators.
pub(crate) fn split_lib_path(path: &str) -> (String, String) {
    let file = path.rsplit(['/', '\\', ':'].as_ref()).next().unwrap_or(path);
    let libname = file.strip_suffix(".elib").unwrap_or(file);
    (format!("{}.elib", libname), libname.to_string())
}

impl ElibParser<'_> {
    /// Read the external-cell record at file index `idx`, and resolve it
    pub(crate) fn read_external(&mut self, idx: usize) -> ElibResult<()> {
        self.ctx_stack.push(ElibContext::ExternalCell);
        let caps = self.dctx.caps;
        if !caps.views {
            return self.fail("Cells of other libraries are not supported before format revision 9");
        }
        let name = match caps.fake_cells {
            true => {
                let k = self.rdr.read_big()?;
                self.fake_name(k)?
            }
            false => {
                let name = self.rdr.read_string()?;
                self.read_ints::<2>()?;
                self.cell_name(name)
            }
        };
        let view = self.rdr.read_big()?;
        let view = self.view(view);
        let [version, creation, revision] = self.read_ints::<3>()?;
        let bbox = self.read_ints::<4>()?;
        let path = self.rdr.read_string()?;
        let num = self.rdr.read_big()?;
        let mut export_names = Vec::with_capacity(self.rdr.check_fits(num.max(0) as usize, 1)?);
        for _ in 0..num.max(0) {
            export_names.push(self.rdr.read_string()?);
        }
        let raw = RawExternal {
            name,
            view,
            version,
            creation,
            revision,
            bbox,
            path,
            export_names,
        };
        let range = self.tables.exports(idx);
        if raw.export_names.len() != range.len() {
            self.count_mismatch(format!(
                "External cell {} lists {} exports, table declares {}",
                raw.qualified_name(),
                raw.export_names.len(),
                range.len()
            ));
        }
        for (global, name) in range.zip(raw.export_names.iter()) {
            self.export_names[global] = Some(name.clone());
        }
        let cref = self.resolve_external(&raw)?;
        self.cell_refs[idx] = Some(cref);
        self.externals[idx] = Some(raw);
        self.ctx_stack.pop();
        Ok(())
    }
    /// Find the cell referred to by `raw`, or create a placeholder for it
    fn resolve_external(&mut self, raw: &RawExternal) -> ElibResult<CellRef> {
        let (file, libname) = split_lib_path(&raw.path);
        let lib = match self.ext_libs.get(&libname) {
            Some(lib) => *lib,
            None => {
                let lib = self.load_library(&file, &libname, &raw.path)?;
                self.ext_libs.insert(libname.clone(), lib);
                lib
            }
        };
        if let Some(lib) = lib {
            if let Some(cref) = self.match_external(lib, raw) {
                return Ok(cref);
            }
        }
        self.placeholder(raw, &libname)
    }
    /// Find or load library `libname`
    fn load_library(
        &mut self,
        file: &str,
        libname: &str,
        stored: &str,
    ) -> ElibResult<Option<LibKey>> {
        if let Some(key) = self.db.find_library(libname) {
            if self.db.is_loading(key) {
                let msg = format!(
                    "Library {} is still being read; its cells are unavailable to {}",
                    libname, self.db.libs[self.lib].name
                );
                soft_error(&mut self.diagnostics, msg);
                return Ok(None);
            }
            return Ok(Some(key));
        }
        let path = match self.locate(file, libname, stored) {
            Some(p) => p,
            None => return self.missing(libname, "cannot be found"),
        };
        info!("Reading referenced library {} from {}", libname, path.display());

        // Read it with a nested parser, lending it our prompt
        let opts = self.opts.clone();
        let prompt = self.prompt.take();
        let (result, prompt) = match ElibParser::open(&path, &mut *self.db, &opts) {
            Ok(mut child) => {
                child.prompt = prompt;
                let result = child.run();
                (result, child.prompt.take())
            }
            Err(e) => (Err(e), prompt),
        };
        self.prompt = prompt;
        match result {
            Ok(report) => {
                self.diagnostics.extend(report.diagnostics);
                Ok(Some(report.lib))
            }
            Err(e) if self.opts.missing_library == MissingLibraryPolicy::Fail => Err(e),
            Err(e) => self.missing(libname, &format!("could not be read: {}", e)),
        }
    }
    /// Search for the file of library `libname`.
    /// Tries beside the library being read, then each search directory, then the stored path,
    /// then the library area, and finally asks our prompt, if we have one.
    fn locate(&mut self, file: &str, libname: &str, stored: &str) -> Option<PathBuf> {
        let mut candidates = Vec::new();
        if let Some(dir) = self.path.as_ref().and_then(|p| p.parent()) {
            candidates.push(dir.join(file));
        }
        for dir in self.opts.search_dirs.iter() {
            candidates.push(dir.join(file));
        }
        candidates.push(PathBuf::from(stored));
        if let Some(area) = &self.opts.library_area {
            candidates.push(area.join(file));
        }
        if let Some(found) = candidates.into_iter().find(|p| p.is_file()) {
            return Some(found);
        }
        let prompt = self.prompt.as_mut()?;
        while let Some(p) = prompt.locate(libname) {
            if p.is_file() {
                return Some(p);
            }
            debug!("No library file at {}", p.display());
        }
        None
    }
    /// Handle a library which cannot be found or read, per our [MissingLibraryPolicy]
    fn missing(&mut self, libname: &str, why: &str) -> ElibResult<Option<LibKey>> {
        match self.opts.missing_library {
            MissingLibraryPolicy::Fail => Err(ElibError::Str(format!(
                "Referenced library {} {}",
                libname, why
            ))),
            MissingLibraryPolicy::Substitute => {
                let msg = format!("Referenced library {} {}", libname, why);
                soft_error(&mut self.diagnostics, msg);
                Ok(None)
            }
        }
    }
    /// Find the cell `raw` in library `lib`, and check that it matches.
    /// Size and export mismatches reject the cell; a changed revision date only warns.
    fn match_external(&mut self, lib: LibKey, raw: &RawExternal) -> Option<CellRef> {
        let target = &self.db.libs[lib];
        let libname = target.name.clone();
        let exact = format!("{};{}{{{}}}", raw.name, raw.version, raw.view.abbreviation);
        let any = format!("{}{{{}}}", raw.name, raw.view.abbreviation);
        let key = match target.find_cell(&exact).or_else(|| target.find_cell(&any)) {
            Some(k) => k,
            None => {
                let msg = format!("Cannot find cell {} in library {}", exact, libname);
                soft_error(&mut self.diagnostics, msg);
                return None;
            }
        };
        let cref = CellRef { lib, cell: key };
        let here = self.db.libs[self.lib].name.clone();
        let qname = format!("{}:{}", libname, raw.qualified_name());

        // Compare sizes in our file's units
        let tech = cell_techs(self.db, &[cref])
            .ok()
            .and_then(|t| t.get(&cref).copied().flatten());
        let lambda = match tech {
            Some(t) => {
                let name = &self.db.registry.tech(t).name;
                self.db.libs[self.lib].lambda(name)
            }
            None => 1.0,
        };
        let cell = self.db.cell(&cref)?;
        let (w, h) = (
            (raw.bbox[1] - raw.bbox[0]) as f64,
            (raw.bbox[3] - raw.bbox[2]) as f64,
        );
        let (cw, ch) = (cell.bounds.width() * lambda, cell.bounds.height() * lambda);
        if (w - cw).abs() > EPSILON || (h - ch).abs() > EPSILON {
            // Same shape at a different scale is accepted
            if !same_aspect(w, h, cw, ch) {
                let msg = format!("Cell {} has changed size since its use in {}", qname, here);
                soft_error(&mut self.diagnostics, msg);
                return None;
            }
        }
        if let Some(missing) = raw.export_names.iter().find(|e| cell.export(e).is_none()) {
            let msg = format!("Cell {} is missing export {}, used in {}", qname, missing, here);
            soft_error(&mut self.diagnostics, msg);
            return None;
        }
        if secs_from_date(&cell.revision) != raw.revision {
            self.diagnostics.push(Diagnostic {
                kind: DiagnosticKind::Warning,
                msg: format!("Cell {} has changed since its use in {}", qname, here),
            });
        }
        Some(cref)
    }
    /// Create a placeholder for unavailable cell `raw` of library `libname`.
    /// Placeholders are named `<cell>FROM<library>`, hold a crossed box the size of the
    /// missing cell, and a pin carrying each of its exports.
    fn placeholder(&mut self, raw: &RawExternal, libname: &str) -> ElibResult<CellRef> {
        let reg = &self.db.registry;
        let crossed = self.unwrap(
            reg.find_node("artwork", "Crossed-Box"),
            "No artwork:Crossed-Box primitive for placeholder cells",
        )?;
        let pin = self.unwrap(
            reg.find_node("generic", "Universal-Pin"),
            "No generic:Universal-Pin primitive for placeholder cells",
        )?;
        let port = match reg.node(pin).ports.first() {
            Some(p) => p.name.clone(),
            None => return self.fail("Universal-Pin has no ports"),
        };
        let tech = match raw.view.name.as_str() {
            "icon" => "artwork",
            "schematic" => "schematic",
            _ => "mocmos",
        };
        let lib = &self.db.libs[self.lib];
        let lambda = lib.lambda(tech);
        let [lx, hx, ly, hy] = raw.bbox.map(|v| v as f64 / lambda);
        let bounds = BoundBox::from_points(&Point::new(lx, ly), &Point::new(hx, hy));
        let (center, w, h) = (bounds.center(), bounds.width(), bounds.height());

        let base = format!("{}FROM{}", raw.name, libname);
        let mut name = base.clone();
        let mut n = 0;
        while lib
            .cells
            .values()
            .any(|c| c.name == name && c.view == raw.view)
        {
            n += 1;
            name = format!("{}.{}", base, n);
        }
        let mut cell = Cell::new(name, raw.view.clone());
        cell.version = raw.version;
        cell.creation = date_from_secs(raw.creation);
        cell.revision = date_from_secs(raw.revision);
        cell.group = lib.cells.values().map(|c| c.group + 1).max().unwrap_or(0);
        cell.nodes.push(NodeInst::new(NodeProto::Primitive(crossed), center, w, h));
        cell.nodes.push(NodeInst::new(NodeProto::Primitive(pin), center, w, h));
        cell.exports = raw
            .export_names
            .iter()
            .map(|e| Export {
                name: e.clone(),
                target: Some(PortInstRef {
                    node: 1,
                    port: port.clone(),
                }),
                descriptor: None,
                user_bits: 0,
                vars: Vec::new(),
            })
            .collect();
        cell.vars
            .push(Variable::new("IO_true_library", VarValue::Str(libname.to_string())));
        cell.bounds = bounds;

        let msg = format!(
            "Cell {} of library {} is unavailable, replaced by {}",
            raw.qualified_name(),
            libname,
            cell.qualified_name()
        );
        soft_error(&mut self.diagnostics, msg);
        let key = self.db.libs[self.lib].cells.insert(cell);
        Ok(CellRef {
            lib: self.lib,
            cell: key,
        })
    }
}
