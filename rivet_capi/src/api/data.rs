//! Data objects: native structs wrapped in managed objects.

use crate::api::constants::CApiConstant;
use crate::error::CapiResult;
use crate::exception::bug;
use crate::object::{DataBody, DataFreeFn, ObjectBody};
use crate::runtime::Runtime;
use rivet_core::Value;
use rivet_gc::Handle;
use std::ffi::c_void;

impl Runtime {
    fn data_body_mut(&mut self, obj: Handle) -> CapiResult<&mut DataBody> {
        let value = self.value_of(obj);
        if !matches!(self.object_of(value).map(|o| &o.body), Some(ObjectBody::Data(_))) {
            return Err(self.wrong_type(value, "Data"));
        }
        match self.object_of_mut(value).map(|o| &mut o.body) {
            Some(ObjectBody::Data(body)) => Ok(body),
            _ => bug("data object changed shape"),
        }
    }

    /// `rb_data_object_alloc`. A nil class means `Data`.
    ///
    /// `free` runs once when the object is collected.
    pub fn data_object_alloc(
        &mut self,
        class: Handle,
        ptr: *mut c_void,
        free: Option<DataFreeFn>,
    ) -> CapiResult<Handle> {
        let class = if class.is_nil() {
            self.core(CApiConstant::Data)
        } else {
            self.expect_module(self.value_of(class))?
        };
        let value = self.alloc(class, ObjectBody::Data(DataBody::new(ptr, free)))?;
        Ok(self.handle_for(value))
    }

    /// `DATA_PTR`.
    pub fn data_ptr(&mut self, obj: Handle) -> CapiResult<*mut c_void> {
        Ok(self.data_body_mut(obj)?.ptr)
    }

    /// Assign `DATA_PTR`.
    pub fn set_data_ptr(&mut self, obj: Handle, ptr: *mut c_void) -> CapiResult<()> {
        self.data_body_mut(obj)?.ptr = ptr;
        Ok(())
    }

    /// Keep `value` alive for as long as the Data object lives.
    ///
    /// Stands in for a mark callback: the collector cannot see managed
    /// values stored inside the native struct.
    pub fn data_retain(&mut self, obj: Handle, value: Handle) -> CapiResult<()> {
        let value: Value = self.value_of(value);
        if value.is_reference() {
            self.data_body_mut(obj)?.retained.push(value);
        }
        Ok(())
    }
}
